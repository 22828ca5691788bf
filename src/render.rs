use crate::{Result, UpsizerError};
use headless_chrome::{Browser, LaunchOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// Shared cancel flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(UpsizerError::Canceled);
        }
        Ok(())
    }
}

/// Loads a URL in a script-executing browser and returns the final document.
pub trait PageRenderer: Send + Sync {
    fn render(&self, url: &str, timeout: Duration, cancel: &CancelToken) -> Result<String>;
}

/// Launches one headless Chrome per render. Dropping the `Browser` kills
/// the process, so every return path releases it.
#[derive(Debug, Clone, Default)]
pub struct ChromeRenderer {
    pub window_size: Option<(u32, u32)>,
}

impl ChromeRenderer {
    pub fn new() -> Self {
        Self {
            window_size: Some((1280, 1024)),
        }
    }
}

impl PageRenderer for ChromeRenderer {
    fn render(&self, url: &str, timeout: Duration, cancel: &CancelToken) -> Result<String> {
        cancel.check()?;
        let started = Instant::now();

        let browser = Browser::new(LaunchOptions {
            headless: true,
            window_size: self.window_size,
            idle_browser_timeout: timeout + Duration::from_secs(5),
            ..Default::default()
        })
        .map_err(|e| UpsizerError::Render(format!("launch failed: {e}")))?;
        let tab = browser
            .new_tab()
            .map_err(|e| UpsizerError::Render(format!("new tab failed: {e}")))?;

        // Every blocking tab call gets only what is left of the budget.
        tab.set_default_timeout(remaining_budget(started, timeout, url)?);
        tab.navigate_to(url)
            .map_err(|e| render_failure(started, timeout, url, "navigate", e))?;

        loop {
            cancel.check()?;
            tab.set_default_timeout(remaining_budget(started, timeout, url)?);
            let ready = tab
                .evaluate("document.readyState", false)
                .ok()
                .and_then(|obj| obj.value)
                .and_then(|v| v.as_str().map(|s| s == "complete"))
                .unwrap_or(false);
            if ready {
                break;
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }

        cancel.check()?;
        tab.set_default_timeout(remaining_budget(started, timeout, url)?);
        let html = tab
            .get_content()
            .map_err(|e| render_failure(started, timeout, url, "reading document", e))?;
        remaining_budget(started, timeout, url)?;
        Ok(html)
    }
}

/// Time left before `timeout` runs out, or `ScrapeTimeout` once it has.
fn remaining_budget(started: Instant, timeout: Duration, url: &str) -> Result<Duration> {
    let left = timeout.saturating_sub(started.elapsed());
    if left.is_zero() {
        return Err(scrape_timeout(url, timeout));
    }
    Ok(left)
}

fn scrape_timeout(url: &str, timeout: Duration) -> UpsizerError {
    UpsizerError::ScrapeTimeout {
        url: url.to_string(),
        timeout_secs: timeout.as_secs(),
    }
}

/// A tab call that failed after the budget ran out is reported as a timeout.
fn render_failure(
    started: Instant,
    timeout: Duration,
    url: &str,
    action: &str,
    err: impl std::fmt::Display,
) -> UpsizerError {
    if started.elapsed() >= timeout {
        return scrape_timeout(url, timeout);
    }
    UpsizerError::Render(format!("{action} failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());
        token.cancel();
        assert!(worker.is_canceled());
        assert!(matches!(worker.check(), Err(UpsizerError::Canceled)));
    }

    #[test]
    fn remaining_budget_shrinks_and_then_times_out() {
        let timeout = Duration::from_secs(15);
        let left = remaining_budget(Instant::now(), timeout, "u").expect("budget");
        assert!(left <= timeout && left > Duration::from_secs(14));

        let Some(started) = Instant::now().checked_sub(Duration::from_secs(16)) else {
            return;
        };
        let err = remaining_budget(started, timeout, "https://example.com/r").expect_err("spent");
        assert!(
            matches!(err, UpsizerError::ScrapeTimeout { timeout_secs: 15, .. }),
            "{err}"
        );
    }

    #[test]
    fn late_tab_failures_are_timeouts() {
        let timeout = Duration::from_secs(15);
        let Some(late) = Instant::now().checked_sub(Duration::from_secs(20)) else {
            return;
        };
        assert!(matches!(
            render_failure(late, timeout, "u", "reading document", "boom"),
            UpsizerError::ScrapeTimeout { .. }
        ));
        let early = render_failure(Instant::now(), timeout, "u", "navigate", "boom");
        assert!(matches!(early, UpsizerError::Render(ref m) if m == "navigate failed: boom"));
    }

    #[test]
    fn canceled_token_short_circuits_before_launch() {
        let token = CancelToken::new();
        token.cancel();
        let err = ChromeRenderer::new()
            .render("https://example.com", Duration::from_secs(1), &token)
            .expect_err("canceled");
        assert!(matches!(err, UpsizerError::Canceled), "{err}");
    }
}
