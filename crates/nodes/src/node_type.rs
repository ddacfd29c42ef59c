//! Typed node vocabulary.
//!
//! Workflow definitions carry free-form type labels. They are parsed into
//! [`NodeType`] once, at the graph boundary, so the traversal never compares
//! strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    ApiTrigger,
    ScheduleTrigger,
    FileTrigger,
    EventTrigger,
    Action,
    Logic,
    Data,
    WaitEvents,
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::Trigger,
        NodeType::ApiTrigger,
        NodeType::ScheduleTrigger,
        NodeType::FileTrigger,
        NodeType::EventTrigger,
        NodeType::Action,
        NodeType::Logic,
        NodeType::Data,
        NodeType::WaitEvents,
    ];

    /// Trigger variants that fall back to the generic `trigger` executor.
    pub const TRIGGER_VARIANTS: [NodeType; 4] = [
        NodeType::ApiTrigger,
        NodeType::ScheduleTrigger,
        NodeType::FileTrigger,
        NodeType::EventTrigger,
    ];

    /// Canonical snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::ApiTrigger => "api_trigger",
            Self::ScheduleTrigger => "schedule_trigger",
            Self::FileTrigger => "file_trigger",
            Self::EventTrigger => "event_trigger",
            Self::Action => "action",
            Self::Logic => "logic",
            Self::Data => "data",
            Self::WaitEvents => "wait_events",
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(
            self,
            Self::Trigger
                | Self::ApiTrigger
                | Self::ScheduleTrigger
                | Self::FileTrigger
                | Self::EventTrigger
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = NodeError;

    /// Case-insensitive; `-` and `_` are interchangeable.
    fn from_str(label: &str) -> Result<Self, Self::Err> {
        let normalized = label.trim().to_ascii_lowercase().replace('-', "_");
        NodeType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| NodeError::UnknownNodeType(label.to_string()))
    }
}
