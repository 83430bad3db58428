use serde::{Deserialize, Serialize};

/// Execution-time estimate for one implementation on one worker, updated after
/// every completed task. Times are in milliseconds.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Profile {
    executions: u64,
    min_time: u64,
    average_time: u64,
    max_time: u64,
}

impl Profile {
    pub fn accumulate(&mut self, observed: u64) {
        if self.executions == 0 {
            self.min_time = observed;
            self.max_time = observed;
            self.average_time = observed;
        } else {
            self.min_time = self.min_time.min(observed);
            self.max_time = self.max_time.max(observed);
            self.average_time =
                (self.average_time * self.executions + observed) / (self.executions + 1);
        }
        self.executions += 1;
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Zero until the first observation; an unknown implementation therefore
    /// yields a default estimate instead of an error.
    pub fn average_execution_time(&self) -> u64 {
        self.average_time
    }

    pub fn min_execution_time(&self) -> u64 {
        self.min_time
    }

    pub fn max_execution_time(&self) -> u64 {
        self.max_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_accumulates_mean() {
        let mut p = Profile::default();
        assert_eq!(p.average_execution_time(), 0);
        p.accumulate(100);
        p.accumulate(300);
        assert_eq!(p.executions(), 2);
        assert_eq!(p.average_execution_time(), 200);
        assert_eq!(p.min_execution_time(), 100);
        assert_eq!(p.max_execution_time(), 300);
        p.accumulate(200);
        assert_eq!(p.average_execution_time(), 200);
    }
}
