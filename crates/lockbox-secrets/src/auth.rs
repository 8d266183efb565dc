//! Authentication gate between a pending cipher and a usable one.
//!
//! The gate drives one challenge at a time: it asks the [`Authenticator`] for
//! the user's passphrase, checks it against the enrolled credential, and only
//! on success releases the [`Cipher`]. Prompting and the Argon2id check run on
//! the blocking pool so the async caller can still be cancelled.

use std::sync::{Arc, Mutex};

use lockbox_core::AuthError;
use lockbox_crypto::Cipher;
use secrecy::{ExposeSecret, SecretString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::{Challenge, PendingCipher};

/// Default environment variable read by [`EnvAuthenticator`]
pub const PASSPHRASE_ENV: &str = "LOCKBOX_PASSPHRASE";

/// Something that can ask the user to prove their identity.
///
/// `prompt` is called on a blocking thread and may block for as long as the
/// user takes. Returning `AuthError::Cancelled` aborts the whole challenge.
pub trait Authenticator: Send + Sync {
    fn prompt(&self, challenge: &Challenge) -> Result<SecretString, AuthError>;

    /// Called after a wrong passphrase when more attempts remain.
    fn on_failed_attempt(&self, _remaining: u32) {}

    /// Called when the operation is cancelled while a prompt is open.
    fn dismiss(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Idle,
    Challenging,
    Authenticated,
    Cancelled,
    Failed,
}

pub struct AuthGate {
    authenticator: Arc<dyn Authenticator>,
    max_attempts: u32,
    state: Mutex<AuthState>,
}

impl AuthGate {
    pub fn new(authenticator: Arc<dyn Authenticator>, max_attempts: u32) -> Self {
        Self {
            authenticator,
            max_attempts: max_attempts.max(1),
            state: Mutex::new(AuthState::Idle),
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve the challenge attached to `pending`.
    ///
    /// Consumes the pending cipher either way; a failed or cancelled
    /// challenge leaves nothing usable behind.
    pub async fn authenticate(
        &self,
        pending: PendingCipher,
        cancel: &CancellationToken,
    ) -> Result<Cipher, AuthError> {
        let mut guard = ChallengeGuard::begin(&self.state)?;
        let challenge = pending.challenge().clone();
        debug!(challenge = challenge.id, mode = %challenge.mode, "auth challenge started");

        let result = self.run(pending, &challenge, cancel).await;
        match &result {
            Ok(_) => {
                info!(challenge = challenge.id, "authenticated");
                guard.settle(AuthState::Authenticated);
            }
            Err(AuthError::Cancelled) => {
                info!(challenge = challenge.id, "authentication cancelled");
                guard.settle(AuthState::Cancelled);
            }
            Err(e) => {
                warn!(challenge = challenge.id, error = %e, "authentication failed");
                guard.settle(AuthState::Failed);
            }
        }
        result
    }

    async fn run(
        &self,
        mut pending: PendingCipher,
        challenge: &Challenge,
        cancel: &CancellationToken,
    ) -> Result<Cipher, AuthError> {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(AuthError::Cancelled);
            }

            let authenticator = Arc::clone(&self.authenticator);
            let prompt_challenge = challenge.clone();
            let prompt =
                tokio::task::spawn_blocking(move || authenticator.prompt(&prompt_challenge));

            let passphrase = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.authenticator.dismiss();
                    return Err(AuthError::Cancelled);
                }
                joined = prompt => joined.map_err(|e| AuthError::HardwareError(e.to_string()))??,
            };
            if passphrase.expose_secret().is_empty() {
                return Err(AuthError::Cancelled);
            }

            let (returned, verified) = tokio::task::spawn_blocking(move || {
                let verified = pending.verify(&passphrase);
                (pending, verified)
            })
            .await
            .map_err(|e| AuthError::HardwareError(e.to_string()))?;
            pending = returned;

            let verified = verified.map_err(|e| AuthError::HardwareError(e.to_string()))?;
            attempts += 1;

            if verified {
                if cancel.is_cancelled() {
                    return Err(AuthError::Cancelled);
                }
                return Ok(pending.into_cipher());
            }
            if attempts >= self.max_attempts {
                return Err(AuthError::Lockout { attempts });
            }
            let remaining = self.max_attempts - attempts;
            debug!(challenge = challenge.id, remaining, "wrong passphrase");
            self.authenticator.on_failed_attempt(remaining);
        }
    }
}

/// Marks the gate busy for the lifetime of one challenge. If the future is
/// dropped mid-challenge the gate goes back to `Idle`.
struct ChallengeGuard<'a> {
    state: &'a Mutex<AuthState>,
    settled: bool,
}

impl<'a> ChallengeGuard<'a> {
    fn begin(state: &'a Mutex<AuthState>) -> Result<Self, AuthError> {
        let mut current = state.lock().unwrap_or_else(|e| e.into_inner());
        if *current == AuthState::Challenging {
            return Err(AuthError::Busy);
        }
        *current = AuthState::Challenging;
        Ok(Self {
            state,
            settled: false,
        })
    }

    fn settle(&mut self, outcome: AuthState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
        self.settled = true;
    }
}

impl Drop for ChallengeGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = AuthState::Idle;
        }
    }
}

/// Interactive passphrase prompt on the controlling terminal.
pub struct TerminalAuthenticator;

impl Authenticator for TerminalAuthenticator {
    fn prompt(&self, challenge: &Challenge) -> Result<SecretString, AuthError> {
        let message = format!(
            "Passphrase to {} with key '{}' (empty to cancel): ",
            challenge.mode, challenge.key_alias
        );
        let input = rpassword::prompt_password(message)
            .map_err(|e| AuthError::HardwareError(format!("reading passphrase: {e}")))?;
        if input.is_empty() {
            return Err(AuthError::Cancelled);
        }
        Ok(SecretString::from(input))
    }

    fn on_failed_attempt(&self, remaining: u32) {
        eprintln!("Wrong passphrase ({remaining} attempts left)");
    }

    /// The blocked read cannot be interrupted, so give the terminal back:
    /// echo on, cursor on a fresh line. The reader thread is left behind and
    /// dies with the process.
    fn dismiss(&self) {
        restore_echo();
        eprintln!();
    }
}

#[cfg(unix)]
fn restore_echo() {
    let tty = match std::fs::File::open("/dev/tty") {
        Ok(tty) => tty,
        Err(e) => {
            debug!(error = %e, "no controlling terminal to restore");
            return;
        }
    };
    match std::process::Command::new("stty")
        .arg("echo")
        .stdin(tty)
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "stty echo failed; run `stty sane` to restore the terminal"),
        Err(e) => warn!(error = %e, "could not run stty; run `stty sane` to restore the terminal"),
    }
}

#[cfg(not(unix))]
fn restore_echo() {}

/// Non-interactive authenticator for scripts: reads the passphrase from an
/// environment variable.
pub struct EnvAuthenticator {
    var: String,
}

impl EnvAuthenticator {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn is_set(&self) -> bool {
        std::env::var_os(&self.var).is_some()
    }
}

impl Default for EnvAuthenticator {
    fn default() -> Self {
        Self::new(PASSPHRASE_ENV)
    }
}

impl Authenticator for EnvAuthenticator {
    fn prompt(&self, _challenge: &Challenge) -> Result<SecretString, AuthError> {
        match std::env::var(&self.var) {
            Ok(value) if value.is_empty() => Err(AuthError::Cancelled),
            Ok(value) => Ok(SecretString::from(value)),
            Err(_) => Err(AuthError::HardwareError(format!("{} is not set", self.var))),
        }
    }
}
