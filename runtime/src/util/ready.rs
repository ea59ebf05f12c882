use std::sync::Arc;

use tokio::sync::watch;

use crate::DealError;

/// One-shot "started" signal fired once startup migrations and deal restarts are done.
#[derive(Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<Option<Result<(), DealError>>>>,
    rx: watch::Receiver<Option<Result<(), DealError>>>,
}

impl Default for ReadySignal {
    fn default() -> Self {
        let (tx, rx) = watch::channel(None);
        Self { tx: Arc::new(tx), rx }
    }
}

impl ReadySignal {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records the startup outcome. Only the first call has any effect.
    pub fn fire(&self, result: Result<(), DealError>) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(result);
            true
        });
    }

    pub fn is_ready(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves with the startup outcome once it is known.
    pub async fn wait(&self) -> Result<(), DealError> {
        let mut rx = self.rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(DealError::illegal_state("ready signal dropped".into()));
            }
        }
    }

    /// Calls `f` with the startup outcome, immediately if it is already known.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(Result<(), DealError>) + Send + 'static,
    {
        let current = self.rx.borrow().clone();
        if let Some(result) = current {
            f(result);
            return;
        }
        let signal = self.clone();
        tokio::spawn(async move { f(signal.wait().await) });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[tokio::test]
    async fn fires_once() {
        let ready = ReadySignal::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        ready.on_ready(move |r| s.lock().unwrap().push(r.is_ok()));
        assert!(!ready.is_ready());

        ready.fire(Ok(()));
        ready.fire(Err(DealError::illegal_state("late".into())));
        assert!(ready.wait().await.is_ok());

        let s = seen.clone();
        ready.on_ready(move |r| s.lock().unwrap().push(r.is_ok()));
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![true, true]);
    }
}
