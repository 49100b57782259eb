//! User prompt utilities using dialoguer

use crate::utils::error::{ProvisionError, Result};
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, MultiSelect, Password, Select};
use tracing::warn;

/// Prompt for text input
pub fn prompt_input(prompt: &str, default: Option<&str>) -> Result<String> {
    let theme = ColorfulTheme::default();
    let mut input = Input::with_theme(&theme).with_prompt(prompt);

    if let Some(d) = default {
        input = input.default(d.to_string());
    }

    input
        .interact_text()
        .map_err(|_| ProvisionError::UserCancelled)
}

/// Ask for a value until `parse` accepts it. Recoverable parse errors
/// re-prompt; anything else is returned.
pub fn prompt_parsed<T>(
    prompt: &str,
    default: Option<&str>,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<T> {
    loop {
        let raw = prompt_input(prompt, default)?;
        match parse(&raw) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_recoverable() => eprintln!("{} {}", style("✗").red(), e),
            Err(e) => return Err(e),
        }
    }
}

/// Collect a passphrase entered twice, retrying on mismatch.
///
/// `read` returns one (entry, confirmation) pair per call. After
/// `max_attempts` mismatched pairs the error is [`ProvisionError::PassphraseMismatch`].
pub fn read_confirmed_passphrase<F>(max_attempts: u32, mut read: F) -> Result<String>
where
    F: FnMut() -> Result<(String, String)>,
{
    for attempt in 1..=max_attempts.max(1) {
        let (first, second) = read()?;
        if first.is_empty() {
            warn!("Empty passphrase rejected (attempt {}/{})", attempt, max_attempts);
            continue;
        }
        if first == second {
            return Ok(first);
        }
        warn!("Passphrases do not match (attempt {}/{})", attempt, max_attempts);
    }
    Err(ProvisionError::PassphraseMismatch)
}

/// Prompt for an encryption passphrase with double entry
pub fn prompt_passphrase(max_attempts: u32) -> Result<String> {
    let theme = ColorfulTheme::default();
    read_confirmed_passphrase(max_attempts, || {
        let first = Password::with_theme(&theme)
            .with_prompt("Encryption passphrase")
            .allow_empty_password(true)
            .interact()
            .map_err(|_| ProvisionError::UserCancelled)?;
        let second = Password::with_theme(&theme)
            .with_prompt("Confirm passphrase")
            .allow_empty_password(true)
            .interact()
            .map_err(|_| ProvisionError::UserCancelled)?;
        Ok((first, second))
    })
}

/// Prompt for yes/no confirmation
pub fn prompt_confirm(prompt: &str, default: bool) -> Result<bool> {
    let theme = ColorfulTheme::default();
    Confirm::with_theme(&theme)
        .with_prompt(prompt)
        .default(default)
        .interact_opt()
        .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?
        .ok_or(ProvisionError::UserCancelled)
}

/// Prompt for selection from a list
pub fn prompt_select<T: ToString>(prompt: &str, items: &[T], default: usize) -> Result<usize> {
    let theme = ColorfulTheme::default();
    Select::with_theme(&theme)
        .with_prompt(prompt)
        .items(items)
        .default(default)
        .interact_opt()
        .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?
        .ok_or(ProvisionError::UserCancelled)
}

/// Prompt for any number of selections from a list
pub fn prompt_multi_select<T: ToString>(prompt: &str, items: &[T]) -> Result<Vec<usize>> {
    let theme = ColorfulTheme::default();
    MultiSelect::with_theme(&theme)
        .with_prompt(prompt)
        .items(items)
        .interact_opt()
        .map_err(|e| ProvisionError::Io(std::io::Error::other(e.to_string())))?
        .ok_or(ProvisionError::UserCancelled)
}

/// Display a warning and ask for confirmation
pub fn warn_confirm(message: &str) -> Result<bool> {
    println!("\n{} {}\n", style("WARNING:").yellow().bold(), message);
    prompt_confirm("Continue?", false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_retries_then_accepts() {
        let mut answers = vec![
            ("secret".to_string(), "secrte".to_string()),
            ("secret".to_string(), "secret".to_string()),
        ]
        .into_iter();
        let pass = read_confirmed_passphrase(3, || Ok(answers.next().unwrap())).unwrap();
        assert_eq!(pass, "secret");
    }

    #[test]
    fn repeated_mismatch_gives_up() {
        let mut calls = 0;
        let err = read_confirmed_passphrase(3, || {
            calls += 1;
            Ok(("a".to_string(), "b".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, ProvisionError::PassphraseMismatch));
        assert_eq!(calls, 3);
    }

    #[test]
    fn empty_passphrase_is_not_accepted() {
        let err = read_confirmed_passphrase(1, || Ok((String::new(), String::new()))).unwrap_err();
        assert!(matches!(err, ProvisionError::PassphraseMismatch));
    }
}
