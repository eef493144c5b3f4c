#![forbid(unsafe_code)]

pub mod planner;
pub mod process;
pub mod runner;

use crate::config::{
    Paths, CONFLICTING_TOKEN_VAR, PASSTHROUGH_KEY_VARS, SUBSCRIPTION_TOKEN_VAR,
};

/// Environment hygiene shared by the planner and the runner: the direct-API
/// token conflicts with subscription auth and is always removed; the
/// subscription token is injected from the env or the token file; auxiliary
/// tool-server keys pass through because the sandbox blocks keychain access.
pub(crate) fn prepare_agent_env(cmd: &mut tokio::process::Command, paths: &Paths) {
    cmd.env_remove(CONFLICTING_TOKEN_VAR);

    match std::env::var(SUBSCRIPTION_TOKEN_VAR) {
        Ok(token) if !token.trim().is_empty() => {
            cmd.env(SUBSCRIPTION_TOKEN_VAR, token);
        }
        _ => {
            let token_file = paths.subscription_token_file();
            match std::fs::read_to_string(&token_file) {
                Ok(token) if !token.trim().is_empty() => {
                    cmd.env(SUBSCRIPTION_TOKEN_VAR, token.trim());
                }
                _ => {
                    tracing::warn!(
                        "{SUBSCRIPTION_TOKEN_VAR} not set and {} missing; \
                         the agent binary may fail to authenticate",
                        token_file.display()
                    );
                }
            }
        }
    }

    for key in PASSTHROUGH_KEY_VARS {
        if let Ok(v) = std::env::var(key) {
            cmd.env(key, v);
        }
    }
}
