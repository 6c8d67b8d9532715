#[derive(Debug, PartialEq, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum TaskStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    // result came from the checkpoint log, the activity did not run again
    Replayed,
}

/// Bookkeeping for one scheduled activity within a run.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct Task {
    id: u64,
    activity: String,
    status: TaskStatus,
    attempts: u32,
}

impl Task {
    pub fn new(id: u64, activity: &str) -> Task {
        Task {
            id,
            activity: activity.to_string(),
            status: TaskStatus::Scheduled,
            attempts: 0,
        }
    }

    pub fn get_task_id(&self) -> u64 {
        self.id
    }

    pub fn get_activity(&self) -> &str {
        &self.activity
    }

    pub fn get_task_status(&self) -> TaskStatus {
        self.status
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
    }

    pub fn get_attempts(&self) -> u32 {
        self.attempts
    }

    /// Marks the start of another attempt.
    pub fn start_attempt(&mut self) {
        self.attempts += 1;
        self.status = TaskStatus::Running;
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Replayed
        )
    }
}
