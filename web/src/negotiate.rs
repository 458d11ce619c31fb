//! Accept-header negotiation between a one-shot JSON response and an event
//! stream.

pub const JSON: &str = "application/json";
pub const EVENT_STREAM: &str = "text/event-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sync,
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated {
    Stream,
    Sync { media_type: &'static str },
}

impl Negotiated {
    pub fn mode(&self) -> Mode {
        match self {
            Negotiated::Stream => Mode::Stream,
            Negotiated::Sync { .. } => Mode::Sync,
        }
    }
}

impl From<Mode> for Negotiated {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Stream => Negotiated::Stream,
            Mode::Sync => Negotiated::Sync { media_type: JSON },
        }
    }
}

/// Pick a representation from an `Accept` header.
///
/// Only exact media types count: the highest positive weight wins and ties go
/// to the range listed first. Absent, wildcard-only, or unsupported headers
/// fall back to `default`.
pub fn negotiate(accept: Option<&str>, default: Mode) -> Negotiated {
    let Some(accept) = accept else {
        return default.into();
    };

    let mut best: Option<(f32, Mode)> = None;
    for range in accept.split(',') {
        let Some((media_type, weight)) = parse_range(range) else {
            continue;
        };
        let mode = match media_type.as_str() {
            JSON => Mode::Sync,
            EVENT_STREAM => Mode::Stream,
            _ => continue,
        };
        if weight <= 0.0 {
            continue;
        }
        // Strictly greater, so an equal weight never displaces an earlier range
        if best.map_or(true, |(top, _)| weight > top) {
            best = Some((weight, mode));
        }
    }

    best.map(|(_, mode)| mode).unwrap_or(default).into()
}

/// Media type (lowercased) and `q` weight of one range, or `None` when the
/// weight cannot be parsed.
fn parse_range(range: &str) -> Option<(String, f32)> {
    let mut parts = range.split(';');
    let media_type = parts.next()?.trim().to_ascii_lowercase();
    if media_type.is_empty() {
        return None;
    }

    let mut weight = 1.0;
    for param in parts {
        let Some((name, value)) = param.split_once('=') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("q") {
            weight = value.trim().parse::<f32>().ok()?.clamp(0.0, 1.0);
        }
    }
    Some((media_type, weight))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_weight_wins() {
        let negotiated = negotiate(
            Some("text/event-stream;q=0.5, application/json;q=1.0"),
            Mode::Stream,
        );

        assert_eq!(negotiated, Negotiated::Sync { media_type: JSON });
    }

    #[test]
    fn test_absent_header_uses_default() {
        assert_eq!(negotiate(None, Mode::Stream), Negotiated::Stream);
        assert_eq!(negotiate(None, Mode::Sync).mode(), Mode::Sync);
    }

    #[test]
    fn test_wildcard_uses_default() {
        assert_eq!(negotiate(Some("*/*"), Mode::Stream), Negotiated::Stream);
        assert_eq!(negotiate(Some("text/*"), Mode::Sync).mode(), Mode::Sync);
    }

    #[test]
    fn test_unsupported_types_use_default() {
        assert_eq!(
            negotiate(Some("text/html, application/xml;q=0.9"), Mode::Stream),
            Negotiated::Stream
        );
    }

    #[test]
    fn test_tie_goes_to_first_listed() {
        assert_eq!(
            negotiate(Some("text/event-stream, application/json"), Mode::Sync),
            Negotiated::Stream
        );
        assert_eq!(
            negotiate(Some("application/json, text/event-stream"), Mode::Stream).mode(),
            Mode::Sync
        );
    }

    #[test]
    fn test_zero_weight_excludes_a_type() {
        assert_eq!(
            negotiate(Some("text/event-stream;q=0, */*"), Mode::Sync).mode(),
            Mode::Sync
        );
    }

    #[test]
    fn test_unparsable_weight_skips_range() {
        assert_eq!(
            negotiate(Some("application/json;q=high, text/event-stream;q=0.2"), Mode::Sync),
            Negotiated::Stream
        );
    }

    #[test]
    fn test_weight_is_clamped_and_case_ignored() {
        assert_eq!(
            negotiate(Some("Text/Event-Stream;Q=7, application/json;q=0.9"), Mode::Sync),
            Negotiated::Stream
        );
    }
}
