//! The owning browsing context, as seen by admission control.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
    Occluded,
}

impl Visibility {
    /// Occluded windows still count as visible for speculation.
    #[must_use]
    pub const fn is_hidden(self) -> bool {
        matches!(self, Self::Hidden)
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "visible" => Ok(Self::Visible),
            "hidden" => Ok(Self::Hidden),
            "occluded" => Ok(Self::Occluded),
            _ => Err(format!(
                "unknown visibility: {s}. Expected one of: visible, hidden, occluded"
            )),
        }
    }
}

/// Read-only view of the context that requests speculation.
pub trait OwnerContext {
    fn visibility(&self) -> Visibility;
    fn preloading_disabled(&self) -> bool;
    fn data_saver_enabled(&self) -> bool;
    fn physical_memory_mb(&self) -> u64;
}

/// Plain-value [`OwnerContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticOwnerContext {
    pub visibility: Visibility,
    pub preloading_disabled: bool,
    pub data_saver_enabled: bool,
    pub physical_memory_mb: u64,
}

impl Default for StaticOwnerContext {
    fn default() -> Self {
        Self {
            visibility: Visibility::Visible,
            preloading_disabled: false,
            data_saver_enabled: false,
            physical_memory_mb: 8192,
        }
    }
}

impl OwnerContext for StaticOwnerContext {
    fn visibility(&self) -> Visibility {
        self.visibility
    }

    fn preloading_disabled(&self) -> bool {
        self.preloading_disabled
    }

    fn data_saver_enabled(&self) -> bool {
        self.data_saver_enabled
    }

    fn physical_memory_mb(&self) -> u64 {
        self.physical_memory_mb
    }
}
