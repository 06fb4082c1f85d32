use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed capability set the model may propose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ReadFile,
    WriteFile,
    SearchText,
    RunShellCommand,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::ReadFile,
        ToolKind::WriteFile,
        ToolKind::SearchText,
        ToolKind::RunShellCommand,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::SearchText => "search_text",
            Self::RunShellCommand => "run_shell_command",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Read-only tools never touch the filesystem or spawn processes.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadFile | Self::SearchText)
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
