/*!
 * Protocol parser boundary.
 *
 * A parser turns raw received text into zero or more frames. Parsers are
 * stateful (text may arrive split at arbitrary points), so every device
 * controller gets its own instance from a [`ParserFactory`].
 */
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Power state reported by or commanded to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Nothing reported yet
    #[default]
    Unknown,
    /// Powered on
    On,
    /// Powered off
    Off,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerState::Unknown => write!(f, "unknown"),
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
        }
    }
}

/// One protocol-meaningful unit of received text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    /// The text the frame was parsed from
    pub raw: String,
    /// Command or keyword carried by the frame
    pub command: Option<String>,
    /// Power state reported by the frame
    pub power_state: Option<PowerState>,
}

impl ParsedFrame {
    /// A frame with no recognized content
    pub fn raw<S: Into<String>>(raw: S) -> Self {
        Self {
            raw: raw.into(),
            command: None,
            power_state: None,
        }
    }
}

/// Translates received text into frames
pub trait ProtocolParser: Send + Sync + Debug {
    /// Parser name used in logs
    fn name(&self) -> &'static str;

    /// Parse one chunk of received text
    fn parse(&self, raw: &str) -> Vec<ParsedFrame>;

    /// Drop any buffered partial input
    fn reset(&self) {}
}

/// Creates one parser per device
pub type ParserFactory = Arc<dyn Fn() -> Box<dyn ProtocolParser> + Send + Sync>;

/// Factory for [`LineProtocolParser`]
pub fn line_parser_factory() -> ParserFactory {
    Arc::new(|| Box::new(LineProtocolParser::new()) as Box<dyn ProtocolParser>)
}

/// Largest partial line kept between calls
const MAX_PENDING: usize = 4096;

/// Newline-delimited text protocol
///
/// Recognizes bare `ON` / `OFF` and key-value power reports such as
/// `POWER ON`, `PWR:1`, `STATE=OFF` or `STATUS 0`. Every other line becomes
/// a frame whose command is its first word.
#[derive(Debug, Default)]
pub struct LineProtocolParser {
    pending: Mutex<String>,
}

impl LineProtocolParser {
    /// Create a parser with an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    fn parse_line(line: &str) -> ParsedFrame {
        let mut tokens = line
            .split(|c: char| c.is_whitespace() || c == ':' || c == '=')
            .filter(|token| !token.is_empty());

        let Some(first) = tokens.next() else {
            return ParsedFrame::raw(line);
        };
        let keyword = first.to_ascii_uppercase();

        let power_state = match keyword.as_str() {
            "ON" => Some(PowerState::On),
            "OFF" => Some(PowerState::Off),
            "POWER" | "PWR" | "STATE" | "STATUS" => tokens.next().and_then(power_value),
            _ => None,
        };

        ParsedFrame {
            raw: line.to_string(),
            command: Some(keyword),
            power_state,
        }
    }
}

fn power_value(token: &str) -> Option<PowerState> {
    match token.to_ascii_uppercase().as_str() {
        "ON" | "1" | "TRUE" => Some(PowerState::On),
        "OFF" | "0" | "FALSE" => Some(PowerState::Off),
        _ => None,
    }
}

impl ProtocolParser for LineProtocolParser {
    fn name(&self) -> &'static str {
        "line"
    }

    fn parse(&self, raw: &str) -> Vec<ParsedFrame> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.push_str(raw);

        let mut frames = Vec::new();
        while let Some(end) = pending.find('\n') {
            let line: String = pending.drain(..=end).collect();
            let line = line.trim_end_matches(['\r', '\n']).trim();
            if !line.is_empty() {
                frames.push(Self::parse_line(line));
            }
        }

        if pending.len() > MAX_PENDING {
            warn!(bytes = pending.len(), "Discarding unterminated input");
            pending.clear();
        }
        frames
    }

    fn reset(&self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(frames: &[ParsedFrame]) -> Vec<Option<PowerState>> {
        frames.iter().map(|frame| frame.power_state).collect()
    }

    #[test]
    fn test_power_reports() {
        let parser = LineProtocolParser::new();
        let frames = parser.parse("ON\r\npower off\nPWR:1\nSTATE=0\nSTATUS TRUE\n");
        assert_eq!(
            states(&frames),
            vec![
                Some(PowerState::On),
                Some(PowerState::Off),
                Some(PowerState::On),
                Some(PowerState::Off),
                Some(PowerState::On),
            ]
        );
        assert_eq!(frames[1].command.as_deref(), Some("POWER"));
        assert_eq!(frames[1].raw, "power off");
    }

    #[test]
    fn test_partial_lines_are_buffered() {
        let parser = LineProtocolParser::new();
        assert!(parser.parse("POW").is_empty());
        assert!(parser.parse("ER O").is_empty());

        let frames = parser.parse("N\nTEMP 21\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].power_state, Some(PowerState::On));
        assert_eq!(frames[1].command.as_deref(), Some("TEMP"));
        assert_eq!(frames[1].power_state, None);
    }

    #[test]
    fn test_blank_lines_and_reset() {
        let parser = LineProtocolParser::new();
        assert!(parser.parse("\r\n\n").is_empty());

        parser.parse("PWR");
        parser.reset();
        assert_eq!(parser.parse(":0\n")[0].power_state, None);
    }

    #[test]
    fn test_unterminated_input_is_bounded() {
        let parser = LineProtocolParser::new();
        parser.parse(&"x".repeat(MAX_PENDING + 1));
        assert_eq!(parser.parse("OFF\n")[0].raw, "OFF");
    }
}
