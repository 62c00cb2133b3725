use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Created, first generation not started yet.
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Suspended,
    /// Between generations: the current one ended with `continue_as_new`
    /// and the next has not started.
    ContinuedAsNew,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Terminated
        )
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Failed | Terminated)
                | (Running, Completed | Failed | Terminated | Suspended | ContinuedAsNew)
                | (Suspended, Running | Terminated)
                | (ContinuedAsNew, Running | Terminated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Pending => "Pending",
            InstanceStatus::Running => "Running",
            InstanceStatus::Completed => "Completed",
            InstanceStatus::Failed => "Failed",
            InstanceStatus::Terminated => "Terminated",
            InstanceStatus::Suspended => "Suspended",
            InstanceStatus::ContinuedAsNew => "ContinuedAsNew",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
