#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use aura_kernel_contracts::ph1hs::HandshakeBudgets;
use aura_kernel_contracts::{ContractViolation, Validate};
use thiserror::Error;
use tracing::debug;

pub const HANDSHAKE_BLOCK: &str = "handshake";
pub const GESTURE_DETECTION_BLOCK: &str = "gesture_detection";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected `key: value`")]
    Malformed { line: usize },
    #[error("line {line}: nested values are not allowed under `{block}:`")]
    Nested { block: &'static str, line: usize },
    #[error("missing `{block}:` block")]
    MissingBlock { block: &'static str },
    #[error("missing key `{block}.{key}`")]
    MissingKey {
        block: &'static str,
        key: &'static str,
    },
    #[error("line {line}: `{block}.{key}` is not a number: {raw:?}")]
    InvalidNumber {
        block: &'static str,
        key: &'static str,
        raw: String,
        line: usize,
    },
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GestureDetectionCaps {
    pub false_positive_cap: f64,
    pub false_negative_cap: f64,
}

impl Validate for GestureDetectionCaps {
    fn validate(&self) -> Result<(), ContractViolation> {
        for (field, v) in [
            ("gesture_detection.false_positive_cap", self.false_positive_cap),
            ("gesture_detection.false_negative_cap", self.false_negative_cap),
        ] {
            if !v.is_finite() {
                return Err(ContractViolation::NotFinite { field });
            }
            if !(0.0..=1.0).contains(&v) {
                return Err(ContractViolation::InvalidRange {
                    field,
                    min: 0.0,
                    max: 1.0,
                    got: v,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UxBudgetsConfig {
    pub handshake: HandshakeBudgets,
    pub gesture_detection: Option<GestureDetectionCaps>,
}

impl UxBudgetsConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loading ux budgets");
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigurationError> {
        let blocks = scan_blocks(text)?;

        let handshake = blocks
            .get(HANDSHAKE_BLOCK)
            .ok_or(ConfigurationError::MissingBlock {
                block: HANDSHAKE_BLOCK,
            })?;
        let handshake = HandshakeBudgets::from_secs_f64(
            number(handshake, HANDSHAKE_BLOCK, "degrade_p50")?,
            number(handshake, HANDSHAKE_BLOCK, "degrade_p95")?,
            number(handshake, HANDSHAKE_BLOCK, "reconnect_p50")?,
            number(handshake, HANDSHAKE_BLOCK, "reconnect_p95")?,
        )?;

        let gesture_detection = match blocks.get(GESTURE_DETECTION_BLOCK) {
            Some(block) => {
                let caps = GestureDetectionCaps {
                    false_positive_cap: number(
                        block,
                        GESTURE_DETECTION_BLOCK,
                        "false_positive_cap",
                    )?,
                    false_negative_cap: number(
                        block,
                        GESTURE_DETECTION_BLOCK,
                        "false_negative_cap",
                    )?,
                };
                caps.validate()?;
                Some(caps)
            }
            None => None,
        };

        Ok(Self {
            handshake,
            gesture_detection,
        })
    }
}

#[derive(Debug)]
struct RawValue {
    text: String,
    line: usize,
}

type Block = BTreeMap<String, RawValue>;

enum Section {
    Outside,
    Recognized {
        name: &'static str,
        indent: Option<usize>,
    },
}

fn recognized_block(key: &str) -> Option<&'static str> {
    match key {
        HANDSHAKE_BLOCK => Some(HANDSHAKE_BLOCK),
        GESTURE_DETECTION_BLOCK => Some(GESTURE_DETECTION_BLOCK),
        _ => None,
    }
}

fn scan_blocks(text: &str) -> Result<BTreeMap<&'static str, Block>, ConfigurationError> {
    let mut blocks: BTreeMap<&'static str, Block> = BTreeMap::new();
    let mut section = Section::Outside;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw_line).trim_end();
        let body = line.trim_start();
        if body.is_empty() {
            continue;
        }
        let width = line.len() - body.len();

        if width == 0 {
            // Any top-level line closes the current block; only recognized headers open one.
            section = match body.split_once(':') {
                Some((key, value)) if value.trim().is_empty() => {
                    match recognized_block(key.trim()) {
                        Some(name) => {
                            blocks.entry(name).or_default();
                            Section::Recognized { name, indent: None }
                        }
                        None => Section::Outside,
                    }
                }
                _ => Section::Outside,
            };
            continue;
        }

        let Section::Recognized { name, indent } = &mut section else {
            continue;
        };
        let name = *name;
        let expected = *indent.get_or_insert(width);
        if width > expected {
            return Err(ConfigurationError::Nested {
                block: name,
                line: line_no,
            });
        }
        if width < expected {
            return Err(ConfigurationError::Malformed { line: line_no });
        }
        let (key, value) = body
            .split_once(':')
            .ok_or(ConfigurationError::Malformed { line: line_no })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigurationError::Malformed { line: line_no });
        }
        if let Some(block) = blocks.get_mut(name) {
            block.insert(
                key.to_string(),
                RawValue {
                    text: unquote(value.trim()).to_string(),
                    line: line_no,
                },
            );
        }
    }
    Ok(blocks)
}

fn number(
    block: &Block,
    block_name: &'static str,
    key: &'static str,
) -> Result<f64, ConfigurationError> {
    let raw = block.get(key).ok_or(ConfigurationError::MissingKey {
        block: block_name,
        key,
    })?;
    raw.text
        .parse::<f64>()
        .map_err(|_| ConfigurationError::InvalidNumber {
            block: block_name,
            key,
            raw: raw.text.clone(),
            line: raw.line,
        })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn unquote(v: &str) -> &str {
    let bytes = v.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = "\
# UX latency budgets
handshake:
  degrade_p50: 1.5
  degrade_p95: 4.0   # guard
  reconnect_p50: 2
  reconnect_p95: \"6.0\"

gesture_detection:
  false_positive_cap: 0.05
  false_negative_cap: 0.10

telemetry:
  flush_s: 30
";

    #[test]
    fn at_cfg_01_parses_handshake_and_gesture_blocks() {
        let cfg = UxBudgetsConfig::parse(SAMPLE).unwrap();
        assert_eq!(cfg.handshake.degrade_p50(), Duration::from_millis(1_500));
        assert_eq!(cfg.handshake.degrade_p95(), Duration::from_secs(4));
        assert_eq!(cfg.handshake.reconnect_p50(), Duration::from_secs(2));
        assert_eq!(cfg.handshake.reconnect_p95(), Duration::from_secs(6));
        assert_eq!(
            cfg.gesture_detection,
            Some(GestureDetectionCaps {
                false_positive_cap: 0.05,
                false_negative_cap: 0.10,
            })
        );
    }

    #[test]
    fn at_cfg_02_missing_key_in_recognized_block_fails() {
        let text = "handshake:\n  degrade_p50: 1\n  degrade_p95: 2\n  reconnect_p50: 1\n";
        assert!(matches!(
            UxBudgetsConfig::parse(text),
            Err(ConfigurationError::MissingKey {
                block: "handshake",
                key: "reconnect_p95"
            })
        ));

        let text = "handshake:\n  degrade_p50: 1\n  degrade_p95: 2\n  reconnect_p50: 1\n  reconnect_p95: 2\ngesture_detection:\n  false_positive_cap: 0.1\n";
        assert!(matches!(
            UxBudgetsConfig::parse(text),
            Err(ConfigurationError::MissingKey {
                block: "gesture_detection",
                key: "false_negative_cap"
            })
        ));
    }

    #[test]
    fn at_cfg_03_missing_handshake_block_fails() {
        assert!(matches!(
            UxBudgetsConfig::parse("telemetry:\n  flush_s: 1\n"),
            Err(ConfigurationError::MissingBlock { block: "handshake" })
        ));
    }

    #[test]
    fn at_cfg_04_invalid_budgets_are_fatal_not_clamped() {
        let text = "handshake:\n  degrade_p50: 5\n  degrade_p95: 2\n  reconnect_p50: 1\n  reconnect_p95: 2\n";
        assert!(matches!(
            UxBudgetsConfig::parse(text),
            Err(ConfigurationError::Contract(_))
        ));
        let text = "handshake:\n  degrade_p50: -1\n  degrade_p95: 2\n  reconnect_p50: 1\n  reconnect_p95: 2\n";
        assert!(matches!(
            UxBudgetsConfig::parse(text),
            Err(ConfigurationError::Contract(_))
        ));
    }

    #[test]
    fn at_cfg_05_non_numeric_value_reports_line() {
        let text = "handshake:\n  degrade_p50: soon\n  degrade_p95: 2\n  reconnect_p50: 1\n  reconnect_p95: 2\n";
        match UxBudgetsConfig::parse(text) {
            Err(ConfigurationError::InvalidNumber { key, line, raw, .. }) => {
                assert_eq!(key, "degrade_p50");
                assert_eq!(line, 2);
                assert_eq!(raw, "soon");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn at_cfg_06_gesture_caps_must_be_probabilities() {
        let text = "handshake:\n  degrade_p50: 1\n  degrade_p95: 2\n  reconnect_p50: 1\n  reconnect_p95: 2\ngesture_detection:\n  false_positive_cap: 1.5\n  false_negative_cap: 0.1\n";
        assert!(matches!(
            UxBudgetsConfig::parse(text),
            Err(ConfigurationError::Contract(ContractViolation::InvalidRange { .. }))
        ));
    }

    #[test]
    fn at_cfg_07_line_without_colon_is_malformed() {
        assert!(matches!(
            UxBudgetsConfig::parse("handshake:\n  degrade_p50 1\n"),
            Err(ConfigurationError::Malformed { line: 2 })
        ));
    }

    const HANDSHAKE_ONLY: &str = "\
handshake:
  degrade_p50: 1.5
  degrade_p95: 4.0
  reconnect_p50: 2.0
  reconnect_p95: 6.0
";

    #[test]
    fn at_cfg_08_unknown_blocks_may_hold_lists_and_nested_maps() {
        let text = format!(
            "---\n{HANDSHAKE_ONLY}telemetry:\n  sinks:\n    - stdout\n    - file\n  retry:\n    max: 3\n- stray\n"
        );
        let cfg = UxBudgetsConfig::parse(&text).unwrap();
        assert_eq!(cfg.handshake, HandshakeBudgets::mvp_v1());
        assert_eq!(cfg.gesture_detection, None);
    }

    #[test]
    fn at_cfg_09_nested_map_inside_handshake_is_rejected() {
        let text = format!("{HANDSHAKE_ONLY}  overrides:\n    degrade_p50: 0.2\n");
        assert!(matches!(
            UxBudgetsConfig::parse(&text),
            Err(ConfigurationError::Nested {
                block: "handshake",
                line: 7
            })
        ));
    }

    #[test]
    fn at_cfg_10_list_item_inside_recognized_block_is_malformed() {
        let text = format!("{HANDSHAKE_ONLY}gesture_detection:\n  - 0.05\n");
        assert!(matches!(
            UxBudgetsConfig::parse(&text),
            Err(ConfigurationError::Malformed { line: 7 })
        ));
    }

    #[test]
    fn at_cfg_11_inconsistent_indent_inside_block_is_malformed() {
        let text = "handshake:\n    degrade_p50: 1.5\n  degrade_p95: 4.0\n";
        assert!(matches!(
            UxBudgetsConfig::parse(text),
            Err(ConfigurationError::Malformed { line: 3 })
        ));
    }
}
