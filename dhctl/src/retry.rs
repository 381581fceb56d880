use std::{fmt::Display, future::Future, time::Duration};

use log::{debug, info};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Returned by a retry loop whose cancellation token fired.
#[derive(Debug, Error)]
#[error("retry loop was interrupted")]
pub struct RetryInterrupted;

type BreakPredicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

/// Bounded retry around an idempotent async operation.
///
/// [`RetryLoop::new`] logs failed attempts at info level, [`RetryLoop::silent`]
/// only at debug.
/// The wait between attempts is interrupted by the cancellation token, and
/// a break predicate can stop retrying on errors that will not go away.
pub struct RetryLoop<E> {
    name: String,
    attempts: u32,
    wait: Duration,
    silent: bool,
    break_if: Option<BreakPredicate<E>>,
    cancellation: Option<CancellationToken>,
}

impl<E> RetryLoop<E>
where
    E: Display + From<RetryInterrupted>,
{
    pub fn new(name: impl Into<String>, attempts: u32, wait: Duration) -> Self {
        Self::build(name.into(), attempts, wait, false)
    }

    pub fn silent(name: impl Into<String>, attempts: u32, wait: Duration) -> Self {
        Self::build(name.into(), attempts, wait, true)
    }

    fn build(name: String, attempts: u32, wait: Duration, silent: bool) -> Self {
        Self {
            name,
            attempts: attempts.max(1),
            wait,
            silent,
            break_if: None,
            cancellation: None,
        }
    }

    pub fn break_if(mut self, predicate: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.break_if = Some(Box::new(predicate));
        self
    }

    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancellation = Some(token.clone());
        self
    }

    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;

        loop {
            if self.is_cancelled() {
                return Err(RetryInterrupted.into());
            }

            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if self.break_if.as_ref().is_some_and(|predicate| predicate(&error)) {
                debug!("[{}] stopped retrying: {error}", self.name);
                return Err(error);
            }

            if attempt >= self.attempts {
                self.log(format_args!(
                    "[{}] giving up after {attempt} attempt(s): {error}",
                    self.name
                ));
                return Err(error);
            }

            self.log(format_args!(
                "[{}] attempt {attempt} of {} failed: {error}; retrying in {:?}",
                self.name, self.attempts, self.wait
            ));

            self.sleep().await?;
            attempt += 1;
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    async fn sleep(&self) -> Result<(), E> {
        match &self.cancellation {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(RetryInterrupted.into()),
                _ = tokio::time::sleep(self.wait) => Ok(()),
            },
            None => {
                tokio::time::sleep(self.wait).await;
                Ok(())
            }
        }
    }

    fn log(&self, message: std::fmt::Arguments) {
        if self.silent {
            debug!("{message}");
        } else {
            info!("{message}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Error, PartialEq)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
        #[error("interrupted")]
        Interrupted,
    }

    impl From<RetryInterrupted> for TestError {
        fn from(_: RetryInterrupted) -> Self {
            TestError::Interrupted
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let calls = &AtomicU32::new(0);

        let result: Result<u32, TestError> = RetryLoop::new("test", 3, Duration::from_secs(1))
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);

        let result = RetryLoop::silent("test", 5, Duration::from_secs(5))
            .run(move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(TestError::Transient),
                    _ => Ok("done"),
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_attempts_run_out() {
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = RetryLoop::new("test", 4, Duration::from_secs(1))
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Transient)
            })
            .await;

        assert_eq!(result, Err(TestError::Transient));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn break_condition_stops_immediately() {
        let calls = &AtomicU32::new(0);

        let result: Result<(), _> = RetryLoop::new("test", 10, Duration::from_secs(1))
            .break_if(|error| *error == TestError::Fatal)
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            })
            .await;

        assert_eq!(result, Err(TestError::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let token = CancellationToken::new();
        let calls = &AtomicU32::new(0);
        let canceller = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = RetryLoop::new("test", 100, Duration::from_secs(20))
            .with_cancellation(&token)
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Transient)
            })
            .await;

        assert_eq!(result, Err(TestError::Interrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_skips_the_operation() {
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), TestError> = RetryLoop::new("test", 3, Duration::from_secs(1))
            .with_cancellation(&token)
            .run(|| async { panic!("must not be called") })
            .await;

        assert_eq!(result, Err(TestError::Interrupted));
    }
}
