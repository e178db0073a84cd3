#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use auth2_contracts::token::TokenId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::bridge::CodeGenerator;

/// Redraw cadence. The countdown itself follows the step deadline, so a
/// different tick only changes how often `seconds_remaining` is refreshed.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Back-to-back generator calls allowed when it keeps answering with a
/// boundary that has already passed. After that the loop waits a tick.
pub const MAX_IMMEDIATE_REGENERATIONS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedTokenState {
    pub token_id: TokenId,
    pub current_code: Option<String>,
    pub seconds_remaining: u32,
    pub last_generated_at: Option<Instant>,
    /// Set by a failed generation, cleared by the next success.
    pub last_error: Option<String>,
}

impl DisplayedTokenState {
    fn blank(token_id: TokenId) -> Self {
        Self {
            token_id,
            current_code: None,
            seconds_remaining: 0,
            last_generated_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshCommand {
    Resync,
    SwitchToken(TokenId),
}

/// Starts one countdown task per active token view.
#[derive(Clone)]
pub struct TokenRefreshScheduler {
    generator: Arc<dyn CodeGenerator>,
    tick: Duration,
}

impl TokenRefreshScheduler {
    pub fn new(generator: Arc<dyn CodeGenerator>, tick: Duration) -> Self {
        Self { generator, tick }
    }

    pub fn with_default_tick(generator: Arc<dyn CodeGenerator>) -> Self {
        Self::new(generator, DEFAULT_TICK)
    }

    /// Generates immediately, then counts down. The task lives exactly as
    /// long as the returned view.
    pub fn activate(&self, token_id: TokenId) -> ActiveTokenView {
        let (state_tx, state_rx) = watch::channel(DisplayedTokenState::blank(token_id));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_countdown(
            Arc::clone(&self.generator),
            self.tick,
            token_id,
            state_tx,
            command_rx,
        ));
        tracing::debug!(token_id = %token_id, "token view activated");
        ActiveTokenView {
            state: state_rx,
            commands: command_tx,
            task,
        }
    }
}

/// Handle for a visible token. Dropping it cancels the countdown and
/// discards any generator call still in flight.
#[derive(Debug)]
pub struct ActiveTokenView {
    state: watch::Receiver<DisplayedTokenState>,
    commands: mpsc::UnboundedSender<RefreshCommand>,
    task: JoinHandle<()>,
}

impl ActiveTokenView {
    pub fn state(&self) -> DisplayedTokenState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<DisplayedTokenState> {
        self.state.clone()
    }

    /// The view came back to the foreground: regenerate now.
    pub fn resume(&self) {
        self.send(RefreshCommand::Resync);
    }

    pub fn switch_token(&self, token_id: TokenId) {
        self.send(RefreshCommand::SwitchToken(token_id));
    }

    /// Same as dropping the view.
    pub fn deactivate(self) {}

    fn send(&self, command: RefreshCommand) {
        if self.commands.send(command).is_err() {
            tracing::warn!(?command, "countdown task already stopped");
        }
    }
}

impl Drop for ActiveTokenView {
    fn drop(&mut self) {
        self.task.abort();
        tracing::debug!(token_id = %self.state.borrow().token_id, "token view deactivated");
    }
}

async fn run_countdown(
    generator: Arc<dyn CodeGenerator>,
    tick: Duration,
    mut token_id: TokenId,
    state: watch::Sender<DisplayedTokenState>,
    mut commands: mpsc::UnboundedReceiver<RefreshCommand>,
) {
    let mut deadline = regenerate(generator.as_ref(), token_id, &state).await;
    let mut ticker = interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let remaining = deadline.map_or(0, seconds_until);
                if remaining > 0 {
                    state.send_modify(|s| s.seconds_remaining = remaining);
                    continue;
                }
            }
            _ = step_boundary(deadline) => {}
            command = commands.recv() => {
                match command {
                    Some(RefreshCommand::Resync) => {}
                    Some(RefreshCommand::SwitchToken(next)) => {
                        token_id = next;
                        state.send_replace(DisplayedTokenState::blank(next));
                    }
                    None => break,
                }
                deadline = regenerate(generator.as_ref(), token_id, &state).await;
                ticker.reset();
                continue;
            }
        }
        // Step over: show 0 while the next code is generated.
        state.send_modify(|s| s.seconds_remaining = 0);
        deadline = regenerate(generator.as_ref(), token_id, &state).await;
        ticker.reset();
    }
}

/// Whole seconds left until `deadline`, rounded up.
fn seconds_until(deadline: Instant) -> u32 {
    let left = deadline.saturating_duration_since(Instant::now());
    let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

async fn step_boundary(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Returns when the new step ends, or `None` to retry on the next tick.
async fn regenerate(
    generator: &dyn CodeGenerator,
    token_id: TokenId,
    state: &watch::Sender<DisplayedTokenState>,
) -> Option<Instant> {
    for attempt in 1..=MAX_IMMEDIATE_REGENERATIONS {
        match generator.generate_current_code(token_id).await {
            Ok(generated) if generated.seconds_until_next_step > 0 => {
                let seconds = u32::try_from(generated.seconds_until_next_step).unwrap_or(u32::MAX);
                state.send_modify(|s| {
                    s.current_code = Some(generated.code);
                    s.seconds_remaining = seconds;
                    s.last_generated_at = Some(Instant::now());
                    s.last_error = None;
                });
                return Some(Instant::now() + Duration::from_secs(u64::from(seconds)));
            }
            Ok(generated) => {
                tracing::debug!(
                    token_id = %token_id,
                    attempt,
                    seconds = generated.seconds_until_next_step,
                    "step boundary already passed; regenerating"
                );
            }
            Err(err) => {
                tracing::warn!(token_id = %token_id, error = %err, "code generation failed");
                state.send_modify(|s| {
                    s.seconds_remaining = 0;
                    s.last_error = Some(err.to_string());
                });
                return None;
            }
        }
    }
    tracing::warn!(token_id = %token_id, "generator keeps returning an expired step");
    state.send_modify(|s| s.seconds_remaining = 0);
    None
}

#[cfg(test)]
mod tests {
    use super::{TokenRefreshScheduler, MAX_IMMEDIATE_REGENERATIONS};
    use crate::bridge::CodeGenerator;
    use async_trait::async_trait;
    use auth2_contracts::token::{GeneratedCode, TokenId};
    use auth2_contracts::BridgeError;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    /// Replays scripted answers, then keeps answering `fallback` seconds.
    struct ScriptedGenerator {
        script: Mutex<VecDeque<Result<i64, BridgeError>>>,
        fallback: i64,
        calls: Mutex<Vec<TokenId>>,
    }

    impl ScriptedGenerator {
        fn new(script: Vec<Result<i64, BridgeError>>, fallback: i64) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn last_id(&self) -> Option<TokenId> {
            self.calls.lock().unwrap().last().copied()
        }
    }

    #[async_trait]
    impl CodeGenerator for ScriptedGenerator {
        async fn generate_current_code(&self, id: TokenId) -> Result<GeneratedCode, BridgeError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(id);
                calls.len()
            };
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(self.fallback));
            next.map(|seconds| GeneratedCode {
                code: format!("{n:06}"),
                seconds_until_next_step: seconds,
            })
        }
    }

    /// Answers the first call at once and holds every later call until
    /// `release` is notified.
    struct HeldGenerator {
        seconds: i64,
        calls: Mutex<usize>,
        release: Notify,
    }

    #[async_trait]
    impl CodeGenerator for HeldGenerator {
        async fn generate_current_code(&self, _id: TokenId) -> Result<GeneratedCode, BridgeError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if n > 1 {
                self.release.notified().await;
            }
            Ok(GeneratedCode {
                code: format!("{n:06}"),
                seconds_until_next_step: self.seconds,
            })
        }
    }

    fn scheduler(generator: Arc<ScriptedGenerator>) -> TokenRefreshScheduler {
        TokenRefreshScheduler::with_default_tick(generator)
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_01_countdown_regenerates_once_at_zero() {
        let generator = ScriptedGenerator::new(Vec::new(), 5);
        let view = scheduler(Arc::clone(&generator)).activate(TokenId(1));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(generator.calls(), 1);
        assert_eq!(view.state().seconds_remaining, 5);
        assert_eq!(view.state().current_code.as_deref(), Some("000001"));

        sleep(Duration::from_millis(3_000)).await;
        assert_eq!(view.state().seconds_remaining, 2);

        sleep(Duration::from_millis(1_490)).await;
        assert_eq!(generator.calls(), 1);
        assert_eq!(view.state().seconds_remaining, 1);

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(generator.calls(), 2);
        assert_eq!(view.state().seconds_remaining, 5);
        assert_eq!(view.state().current_code.as_deref(), Some("000002"));
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_02_non_positive_countdown_regenerates_immediately() {
        let generator = ScriptedGenerator::new(vec![Ok(0)], 5);
        let view = scheduler(Arc::clone(&generator)).activate(TokenId(1));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(generator.calls(), 2);
        assert_eq!(view.state().seconds_remaining, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_03_broken_generator_cannot_spin() {
        let generator = ScriptedGenerator::new(Vec::new(), -3);
        let view = scheduler(Arc::clone(&generator)).activate(TokenId(1));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(generator.calls(), MAX_IMMEDIATE_REGENERATIONS as usize);
        assert_eq!(view.state().current_code, None);

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(generator.calls(), 2 * MAX_IMMEDIATE_REGENERATIONS as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_04_failure_is_exposed_and_retried_next_tick() {
        let generator = ScriptedGenerator::new(
            vec![Err(BridgeError::Generation("clock skew".to_string()))],
            30,
        );
        let view = scheduler(Arc::clone(&generator)).activate(TokenId(1));

        sleep(Duration::from_millis(10)).await;
        let state = view.state();
        assert!(state.last_error.as_deref().unwrap().contains("clock skew"));
        assert_eq!(state.current_code, None);

        sleep(Duration::from_millis(1_000)).await;
        let state = view.state();
        assert_eq!(generator.calls(), 2);
        assert_eq!(state.last_error, None);
        assert_eq!(state.seconds_remaining, 30);
        assert!(state.last_generated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_05_resume_and_token_change_resync() {
        let generator = ScriptedGenerator::new(Vec::new(), 5);
        let view = scheduler(Arc::clone(&generator)).activate(TokenId(1));

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(view.state().seconds_remaining, 3);

        view.resume();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(generator.calls(), 2);
        assert_eq!(view.state().seconds_remaining, 5);

        view.switch_token(TokenId(9));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(generator.calls(), 3);
        assert_eq!(generator.last_id(), Some(TokenId(9)));
        assert_eq!(view.state().token_id, TokenId(9));

        // Countdown restarted from the resync, not from the old schedule.
        sleep(Duration::from_millis(4_900)).await;
        assert_eq!(generator.calls(), 3);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(generator.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_06_deactivation_stops_generation() {
        let generator = ScriptedGenerator::new(Vec::new(), 2);
        let view = scheduler(Arc::clone(&generator)).activate(TokenId(1));

        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(generator.calls(), 2);

        view.deactivate();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_07_countdown_shows_zero_while_regenerating() {
        let generator = Arc::new(HeldGenerator {
            seconds: 5,
            calls: Mutex::new(0),
            release: Notify::new(),
        });
        let view = TokenRefreshScheduler::with_default_tick(generator.clone()).activate(TokenId(1));

        sleep(Duration::from_millis(4_010)).await;
        assert_eq!(view.state().seconds_remaining, 1);

        sleep(Duration::from_millis(1_000)).await;
        assert_eq!(*generator.calls.lock().unwrap(), 2);
        let state = view.state();
        assert_eq!(state.seconds_remaining, 0);
        assert_eq!(state.current_code.as_deref(), Some("000001"));

        generator.release.notify_one();
        sleep(Duration::from_millis(10)).await;
        let state = view.state();
        assert_eq!(state.seconds_remaining, 5);
        assert_eq!(state.current_code.as_deref(), Some("000002"));
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_08_long_tick_still_regenerates_on_the_step() {
        let generator = ScriptedGenerator::new(Vec::new(), 5);
        let view = TokenRefreshScheduler::new(generator.clone(), Duration::from_secs(60))
            .activate(TokenId(1));

        sleep(Duration::from_millis(4_900)).await;
        assert_eq!(generator.calls(), 1);

        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(generator.calls(), 2);
        assert_eq!(view.state().seconds_remaining, 5);
        assert_eq!(view.state().current_code.as_deref(), Some("000002"));
    }

    #[tokio::test(start_paused = true)]
    async fn at_refresh_09_short_tick_counts_whole_seconds() {
        let generator = ScriptedGenerator::new(Vec::new(), 5);
        let view = TokenRefreshScheduler::new(generator.clone(), Duration::from_millis(250))
            .activate(TokenId(1));

        sleep(Duration::from_millis(1_010)).await;
        assert_eq!(view.state().seconds_remaining, 4);

        sleep(Duration::from_millis(3_500)).await;
        assert_eq!(generator.calls(), 1);
        assert_eq!(view.state().seconds_remaining, 1);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(generator.calls(), 2);
        assert_eq!(view.state().seconds_remaining, 5);
    }
}
