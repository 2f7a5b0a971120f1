use std::time::Duration;

/// Extra attempts `retry_stale` makes after the first failure
pub const DEFAULT_TRANSIENT_ATTEMPTS: u32 = 2;
pub const DEFAULT_TRANSIENT_PAUSE: Duration = Duration::from_millis(500);

/// Failure of a single UI interaction
#[derive(Debug, thiserror::Error)]
pub enum InteractionError {
    /// The element went away between lookup and use; looking it up again may work
    #[error("stale element reference: {0}")]
    StaleElement(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InteractionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, InteractionError::StaleElement(_))
    }
}

/// Run `op`, re-running it up to `attempts` more times while it fails with a
/// stale-element error. Any other error is returned at once.
pub fn retry_transient<T, F>(attempts: u32, pause: Duration, mut op: F) -> Result<T, InteractionError>
where
    F: FnMut() -> Result<T, InteractionError>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < attempts => {
                attempt += 1;
                log::debug!("{} (retry {}/{})", e, attempt, attempts);
                if !pause.is_zero() {
                    std::thread::sleep(pause);
                }
            }
            other => return other,
        }
    }
}

/// [`retry_transient`] with the default attempts and pause
pub fn retry_stale<T, F>(op: F) -> Result<T, InteractionError>
where
    F: FnMut() -> Result<T, InteractionError>,
{
    retry_transient(DEFAULT_TRANSIENT_ATTEMPTS, DEFAULT_TRANSIENT_PAUSE, op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_from_stale_element() {
        let mut calls = 0;
        let text = retry_transient(2, Duration::ZERO, || {
            calls += 1;
            if calls < 3 {
                Err(InteractionError::StaleElement("Login button".into()))
            } else {
                Ok("Welcome")
            }
        })
        .unwrap();
        assert_eq!(text, "Welcome");
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_gives_up_after_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = retry_transient(2, Duration::ZERO, || {
            calls += 1;
            Err(InteractionError::StaleElement("row".into()))
        });
        assert!(matches!(result, Err(InteractionError::StaleElement(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_other_errors_surface_immediately() {
        let mut calls = 0;
        let result: Result<(), _> = retry_transient(5, Duration::ZERO, || {
            calls += 1;
            Err(anyhow::anyhow!("no such element").into())
        });
        assert!(matches!(result, Err(InteractionError::Other(_))));
        assert_eq!(calls, 1);
    }
}
