//! Opaque seam for natural-text command interpretation.
//!
//! The dispatcher treats interpretation as a synchronous black box: text
//! in, structured command out. Anything below the confidence floor is
//! declined, never acted on.

use guardian_types::models::CommandAction;

/// Interpretations below this confidence are declined by the dispatcher.
pub const MIN_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct Interpretation {
    pub action: Option<CommandAction>,
    pub target_device_id: Option<String>,
    pub confidence: f32,
}

pub trait CommandInterpreter: Send + Sync {
    fn interpret(&self, text: &str) -> Interpretation;
}

/// Baseline keyword matcher. Stands in for the real language model behind
/// the same trait; accuracy is not a goal here.
#[derive(Debug, Default)]
pub struct KeywordInterpreter;

impl CommandInterpreter for KeywordInterpreter {
    fn interpret(&self, text: &str) -> Interpretation {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered.split_whitespace().collect();

        let action = if lowered.contains("unlock") {
            Some(CommandAction::Unlock)
        } else if lowered.contains("lockdown") {
            Some(CommandAction::EmergencyLockdown)
        } else if lowered.contains("lock") {
            Some(CommandAction::Lock)
        } else if lowered.contains("locate") || lowered.contains("find") {
            Some(CommandAction::Locate)
        } else {
            None
        };

        // Target is the word following "device", e.g. "lock device dev-2"
        let target_device_id = words
            .iter()
            .position(|w| *w == "device")
            .and_then(|i| words.get(i + 1))
            .map(|w| w.to_string());

        let confidence = match (&action, &target_device_id) {
            (Some(_), Some(_)) => 0.9,
            (Some(_), None) | (None, Some(_)) => 0.3,
            (None, None) => 0.0,
        };

        Interpretation {
            action,
            target_device_id,
            confidence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_action_and_target() {
        let interp = KeywordInterpreter.interpret("please lock device dev-2 now");
        assert_eq!(interp.action, Some(CommandAction::Lock));
        assert_eq!(interp.target_device_id.as_deref(), Some("dev-2"));
        assert!(interp.confidence >= MIN_CONFIDENCE);
    }

    #[test]
    fn unlock_wins_over_lock_substring() {
        let interp = KeywordInterpreter.interpret("unlock device dev-1");
        assert_eq!(interp.action, Some(CommandAction::Unlock));
    }

    #[test]
    fn gibberish_scores_below_floor() {
        let interp = KeywordInterpreter.interpret("what a lovely day");
        assert!(interp.confidence < MIN_CONFIDENCE);
    }
}
