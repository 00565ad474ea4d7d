use std::sync::atomic::{AtomicBool, Ordering};

/// One-way shutdown signal shared by the workers of a session.
#[derive(Debug, Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the flag. Returns true only for the call that raised it.
    pub fn signal(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_once() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        assert!(flag.signal());
        assert!(flag.is_set());
        assert!(!flag.signal());
        assert!(flag.is_set());
    }

    #[test]
    fn test_single_transition_across_threads() {
        let flag = Arc::new(ShutdownFlag::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flag = Arc::clone(&flag);
                thread::spawn(move || flag.signal())
            })
            .collect();
        let raised = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&raised| raised)
            .count();
        assert_eq!(raised, 1);
    }
}
