use crate::playbook::Task;

/// Handler structure (a named task triggered by notifications)
#[derive(Debug, Clone)]
pub struct Handler {
    pub task: Task,
    /// Additional topics this handler answers to.
    pub listen: Vec<String>,
}

impl Handler {
    pub fn answers_to(&self, notification: &str) -> bool {
        self.task.name == notification || self.listen.iter().any(|l| l == notification)
    }
}
