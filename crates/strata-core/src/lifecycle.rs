use crate::CoreError;
use std::fmt;

/// Where a single layer is in the build pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Pending,
    CacheChecked,
    BaseMaterialized,
    ImportsApplied,
    CommandsRun,
    Diffed,
    MetadataCommitted,
    Snapshotted,
    Done,
    Failed,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LayerState::Pending => "pending",
            LayerState::CacheChecked => "cache-checked",
            LayerState::BaseMaterialized => "base-materialized",
            LayerState::ImportsApplied => "imports-applied",
            LayerState::CommandsRun => "commands-run",
            LayerState::Diffed => "diffed",
            LayerState::MetadataCommitted => "metadata-committed",
            LayerState::Snapshotted => "snapshotted",
            LayerState::Done => "done",
            LayerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl LayerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LayerState::Done | LayerState::Failed)
    }
}

pub fn validate_transition(from: LayerState, to: LayerState) -> Result<(), CoreError> {
    use LayerState::{
        BaseMaterialized, CacheChecked, CommandsRun, Diffed, Done, Failed, ImportsApplied,
        MetadataCommitted, Pending, Snapshotted,
    };

    let valid = matches!(
        (from, to),
        (Pending, CacheChecked)
            | (CacheChecked, Done | BaseMaterialized)
            | (BaseMaterialized, ImportsApplied)
            | (ImportsApplied, CommandsRun)
            // build-only layers skip packaging and go straight to snapshot
            | (CommandsRun, Diffed | Snapshotted)
            | (Diffed, MetadataCommitted)
            | (MetadataCommitted, Snapshotted)
            | (Snapshotted, Done)
    ) || (to == Failed && !from.is_terminal());

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
