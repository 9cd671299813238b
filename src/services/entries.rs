//! Turning raw replies into validated, deduplicated contest entries.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

use crate::{
    dao::models::{Entry, truncate_to_millis},
    social::{RawReply, UserInfo},
};

/// Size of a Solana public key.
const WALLET_BYTES: usize = 32;

/// Validity thresholds applied to every reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EntryRules {
    /// Minimum number of characters once surrounding whitespace is trimmed.
    #[validate(range(min = 1, max = 280))]
    pub min_text_len: usize,
    /// Replies must contain a Solana wallet address.
    pub require_wallet: bool,
    /// Words that must all appear in the reply, case-insensitively.
    pub required_keywords: Vec<String>,
    /// Minimum follower count of the author, if any.
    pub min_followers: Option<u64>,
    /// The contest account itself; its replies are never entries.
    #[serde(skip)]
    pub bot_account_id: Option<String>,
}

impl Default for EntryRules {
    fn default() -> Self {
        Self {
            min_text_len: 1,
            require_wallet: true,
            required_keywords: Vec::new(),
            min_followers: None,
            bot_account_id: None,
        }
    }
}

impl EntryRules {
    /// Whether normalization needs the author's profile.
    pub fn needs_author_profile(&self) -> bool {
        self.min_followers.is_some()
    }
}

/// Why a reply is not a valid entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// Nothing but whitespace.
    #[error("empty reply")]
    Empty,
    /// Posted by the contest account.
    #[error("reply from the contest account")]
    OwnAccount,
    /// Shorter than `min_text_len`.
    #[error("reply shorter than {min} characters")]
    TooShort {
        /// Configured minimum.
        min: usize,
    },
    /// A required keyword is absent.
    #[error("missing keyword `{keyword}`")]
    MissingKeyword {
        /// The first absent keyword.
        keyword: String,
    },
    /// No wallet address in the text.
    #[error("no valid wallet address")]
    MissingWallet,
    /// Author has too few followers.
    #[error("author has {followers} followers, {min} required")]
    TooFewFollowers {
        /// Observed count.
        followers: u64,
        /// Configured minimum.
        min: u64,
    },
    /// The author's profile is gone (suspended or deleted account).
    #[error("author profile unavailable")]
    AuthorUnavailable,
}

/// Build an entry from `reply` and record whether it passes `rules`.
///
/// `author` is only consulted for the follower threshold; when it is `None`
/// that check is skipped.
pub fn normalize(reply: &RawReply, rules: &EntryRules, author: Option<&UserInfo>) -> Entry {
    let text = reply.text.trim();
    let wallet = extract_wallets(text).into_iter().next();
    let rejection = check(text, reply, rules, author, wallet.as_deref()).err();

    Entry {
        author_id: reply.author_id.clone(),
        author_username: reply
            .author_username
            .clone()
            .or_else(|| author.map(|user| user.username.clone())),
        external_id: reply.external_id.clone(),
        text: text.to_owned(),
        submitted_at: truncate_to_millis(reply.timestamp),
        valid: rejection.is_none(),
        wallet,
        rejection: rejection.map(|reason| reason.to_string()),
    }
}

fn check(
    text: &str,
    reply: &RawReply,
    rules: &EntryRules,
    author: Option<&UserInfo>,
    wallet: Option<&str>,
) -> Result<(), Rejection> {
    if text.is_empty() {
        return Err(Rejection::Empty);
    }
    if rules.bot_account_id.as_deref() == Some(reply.author_id.as_str()) {
        return Err(Rejection::OwnAccount);
    }
    if text.chars().count() < rules.min_text_len {
        return Err(Rejection::TooShort {
            min: rules.min_text_len,
        });
    }

    let lowered = text.to_lowercase();
    if let Some(keyword) = rules
        .required_keywords
        .iter()
        .find(|keyword| !lowered.contains(&keyword.to_lowercase()))
    {
        return Err(Rejection::MissingKeyword {
            keyword: keyword.clone(),
        });
    }

    if rules.require_wallet && wallet.is_none() {
        return Err(Rejection::MissingWallet);
    }

    if let (Some(min), Some(author)) = (rules.min_followers, author) {
        if author.followers_count < min {
            return Err(Rejection::TooFewFollowers {
                followers: author.followers_count,
                min,
            });
        }
    }

    Ok(())
}

/// Mark `entry` invalid for `reason`.
pub fn reject(entry: &mut Entry, reason: Rejection) {
    entry.valid = false;
    entry.rejection = Some(reason.to_string());
}

/// Keep the `incoming` entries whose dedup key is neither in `existing` nor
/// earlier in `incoming`, in arrival order.
pub fn dedupe(existing: &[Entry], incoming: Vec<Entry>) -> Vec<Entry> {
    let mut seen: HashSet<(String, String)> = existing
        .iter()
        .map(|entry| (entry.author_id.clone(), entry.external_id.clone()))
        .collect();

    incoming
        .into_iter()
        .filter(|entry| seen.insert((entry.author_id.clone(), entry.external_id.clone())))
        .collect()
}

/// Solana wallet addresses in `text`, in order of appearance, without repeats.
///
/// A candidate is a whole word of 32 to 44 base58 characters that decodes to
/// exactly 32 bytes.
pub fn extract_wallets(text: &str) -> Vec<String> {
    let mut wallets: Vec<String> = Vec::new();
    for word in text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if (32..=44).contains(&word.len())
            && is_public_key(word)
            && !wallets.iter().any(|known| known == word)
        {
            wallets.push(word.to_owned());
        }
    }
    wallets
}

/// Whether `word` is base58 for exactly one public key.
fn is_public_key(word: &str) -> bool {
    bs58::decode(word)
        .into_vec()
        .is_ok_and(|bytes| bytes.len() == WALLET_BYTES)
}
