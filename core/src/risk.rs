//! Static risk classification of proposed tool invocations.
//!
//! The tables are hard-coded: the broker does not learn, score, or consult
//! anything external. Unknown tools land in the middle tier.

use serde_json::Value;
use toolgate_protocol::InputMap;
use toolgate_protocol::RiskLevel;
use toolgate_protocol::ToolCategory;

/// Upper bound on the user-facing summary, in characters.
const SUMMARY_MAX_CHARS: usize = 100;

/// Input fields worth surfacing in a one-line summary, in priority order.
const SUMMARY_FIELDS: &[&str] = &["command", "file_path", "url", "pattern", "query"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub category: ToolCategory,
    pub summary: String,
}

pub fn assess_tool_risk(tool_name: &str, input: &InputMap) -> RiskAssessment {
    let (level, category) = match tool_name {
        "Read" | "Glob" | "Grep" | "LS" | "NotebookRead" | "TodoRead" => {
            (RiskLevel::Low, ToolCategory::ReadOnly)
        }
        "Write" | "Edit" | "MultiEdit" | "NotebookEdit" | "TodoWrite" => {
            (RiskLevel::Medium, ToolCategory::Edit)
        }
        "Bash" | "Task" | "KillShell" => (RiskLevel::High, ToolCategory::Execution),
        "WebFetch" | "WebSearch" => (RiskLevel::High, ToolCategory::Network),
        _ => (RiskLevel::Medium, ToolCategory::Unknown),
    };

    RiskAssessment {
        level,
        category,
        summary: summarize(tool_name, input),
    }
}

/// A short phrase like `Bash: cargo test`, built from the first recognized
/// input field.
fn summarize(tool_name: &str, input: &InputMap) -> String {
    for field in SUMMARY_FIELDS {
        if let Some(Value::String(value)) = input.get(*field) {
            return truncate_chars(&format!("{tool_name}: {value}"), SUMMARY_MAX_CHARS);
        }
    }
    truncate_chars(tool_name, SUMMARY_MAX_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        truncated.push('…');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_with(key: &str, value: &str) -> InputMap {
        let mut input = InputMap::new();
        input.insert(key.to_string(), json!(value));
        input
    }

    #[test]
    fn read_only_tools_are_low_risk() {
        let assessment = assess_tool_risk("Read", &input_with("file_path", "/etc/hosts"));
        assert_eq!(assessment.level, RiskLevel::Low);
        assert_eq!(assessment.category, ToolCategory::ReadOnly);
        assert_eq!(assessment.summary, "Read: /etc/hosts");
    }

    #[test]
    fn shell_execution_is_high_risk() {
        let assessment = assess_tool_risk("Bash", &input_with("command", "rm -rf /tmp/x"));
        assert_eq!(assessment.level, RiskLevel::High);
        assert_eq!(assessment.category, ToolCategory::Execution);
    }

    #[test]
    fn unknown_tools_default_to_medium() {
        let assessment = assess_tool_risk("FrobnicateDisk", &InputMap::new());
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert_eq!(assessment.category, ToolCategory::Unknown);
        assert_eq!(assessment.summary, "FrobnicateDisk");
    }

    #[test]
    fn summary_is_truncated_on_a_char_boundary() {
        let long = "é".repeat(400);
        let assessment = assess_tool_risk("Write", &input_with("file_path", &long));
        assert_eq!(assessment.summary.chars().count(), SUMMARY_MAX_CHARS);
        assert!(assessment.summary.ends_with('…'));
    }

    #[test]
    fn command_outranks_file_path_in_summary() {
        let mut input = input_with("file_path", "/a");
        input.insert("command".to_string(), json!("ls"));
        let assessment = assess_tool_risk("Bash", &input);
        assert_eq!(assessment.summary, "Bash: ls");
    }
}
