//! Winner selection through a bounded exchange with the reasoning model.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    dao::models::{Entry, EntryId, GameType},
    reasoning::{Reasoner, ReasonerError},
    services::prompts,
};

/// Calls made for one selection: the first answer plus one corrective retry.
const MAX_ATTEMPTS: u32 = 2;

/// Judge configuration.
#[derive(Debug, Clone)]
pub struct JudgeSettings {
    /// Only the first `max_entries_considered` valid entries are shown to the model.
    pub max_entries_considered: usize,
    /// Operator instructions appended to the catalog ones.
    pub custom_instructions: Option<String>,
    /// Upper bound on one reasoning call.
    pub call_timeout: Duration,
}

impl JudgeSettings {
    /// Longest a selection can take when every attempt runs into `call_timeout`.
    pub fn worst_case(&self) -> Duration {
        self.call_timeout * MAX_ATTEMPTS
    }
}

/// What the judge is deciding about.
#[derive(Debug, Clone, Copy)]
pub struct JudgeContext<'a> {
    /// Contest flavour.
    pub game_type: GameType,
    /// The prompt players replied to.
    pub prompt_text: &'a str,
}

/// The judge's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Winning entry, always one of the submitted valid entries.
    pub entry_id: EntryId,
    /// The model's explanation, if it gave one.
    pub reasoning: Option<String>,
}

/// Why a single attempt produced no usable verdict.
#[derive(Debug, Error)]
pub enum AttemptProblem {
    /// The reasoning call itself failed.
    #[error(transparent)]
    Call(#[from] ReasonerError),
    /// The call exceeded `call_timeout`.
    #[error("reasoning call timed out after {0:?}")]
    TimedOut(Duration),
    /// The answer did not contain a reply id.
    #[error("unparseable answer: {0}")]
    Unparseable(String),
    /// The answer named an id that is not a valid entry.
    #[error("answer names unknown entry `{0}`")]
    UnknownEntry(String),
}

/// Winner selection failed after the corrective retry.
#[derive(Debug, Error)]
#[error("judge produced no usable verdict after {attempts} attempt(s)")]
pub struct JudgeError {
    /// Calls made.
    pub attempts: u32,
    /// Problem with the last attempt.
    #[source]
    pub last: AttemptProblem,
}

#[derive(Serialize)]
struct Candidate<'a> {
    reply_id: &'a str,
    author: Option<&'a str>,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    wallet: Option<&'a str>,
}

#[derive(Deserialize)]
struct Answer {
    reply_id: Option<Value>,
    #[serde(default, alias = "chain_of_thought")]
    reason: Option<String>,
}

/// Picks the winner of a game among its valid entries.
#[derive(Clone)]
pub struct Judge {
    reasoner: Arc<dyn Reasoner>,
    settings: JudgeSettings,
}

impl Judge {
    /// Build a judge over `reasoner`.
    pub fn new(reasoner: Arc<dyn Reasoner>, settings: JudgeSettings) -> Self {
        Self { reasoner, settings }
    }

    /// Select one winner among the valid `entries`.
    ///
    /// Returns `Ok(None)` without calling the model when no entry is valid. A
    /// returned id is always one of the valid entries shown to the model.
    pub async fn select_winner(
        &self,
        entries: &[Entry],
        context: JudgeContext<'_>,
    ) -> Result<Option<Verdict>, JudgeError> {
        let candidates: Vec<&Entry> = entries
            .iter()
            .filter(|entry| entry.valid)
            .take(self.settings.max_entries_considered)
            .collect();
        if candidates.is_empty() {
            debug!("no valid entries; skipping the reasoning call");
            return Ok(None);
        }

        let prompt = self.build_prompt(&candidates, context);
        let mut request = prompt.clone();
        let mut attempt = 1;

        loop {
            match self.attempt(request, &candidates).await {
                Ok(verdict) => return Ok(Some(verdict)),
                Err(problem) if attempt < MAX_ATTEMPTS => {
                    warn!(attempt, problem = %problem, "unusable judge answer; asking again");
                    request = corrective_prompt(&prompt, &problem);
                    attempt += 1;
                }
                Err(problem) => {
                    return Err(JudgeError {
                        attempts: attempt,
                        last: problem,
                    });
                }
            }
        }
    }

    async fn attempt(&self, prompt: String, candidates: &[&Entry]) -> Result<Verdict, AttemptProblem> {
        let call = self
            .reasoner
            .complete(prompt, prompts::JUDGE_CONTEXT.to_owned());
        let answer = timeout(self.settings.call_timeout, call)
            .await
            .map_err(|_| AttemptProblem::TimedOut(self.settings.call_timeout))??;
        parse_verdict(&answer, candidates)
    }

    fn build_prompt(&self, candidates: &[&Entry], context: JudgeContext<'_>) -> String {
        let listing: Vec<Candidate<'_>> = candidates
            .iter()
            .map(|entry| Candidate {
                reply_id: &entry.external_id,
                author: entry.author_username.as_deref(),
                text: &entry.text,
                wallet: entry.wallet.as_deref(),
            })
            .collect();
        let listing = serde_json::to_string_pretty(&listing).unwrap_or_default();
        let instructions = prompts::judging_instructions(
            context.game_type,
            self.settings.custom_instructions.as_deref(),
        );

        format!(
            "The game prompt was:\n{prompt}\n\n\
             Here are the reply entries in JSON format:\n{listing}\n\n\
             For this game, {instructions}\n\
             Reply with the `reply_id` of exactly one entry from the list.",
            prompt = context.prompt_text,
        )
    }
}

fn corrective_prompt(prompt: &str, problem: &AttemptProblem) -> String {
    format!(
        "{prompt}\n\nYour previous answer could not be used ({problem}). \
         Answer again with a JSON object whose `reply_id` is copied exactly from the list above."
    )
}

/// Extract the winning id from a model answer and check it against `candidates`.
fn parse_verdict(answer: &str, candidates: &[&Entry]) -> Result<Verdict, AttemptProblem> {
    let unparseable = || AttemptProblem::Unparseable(abbreviate(answer));

    // Models often wrap JSON in prose or code fences.
    let start = answer.find('{').ok_or_else(unparseable)?;
    let end = answer.rfind('}').ok_or_else(unparseable)?;
    if end < start {
        return Err(unparseable());
    }
    let parsed: Answer = serde_json::from_str(&answer[start..=end]).map_err(|_| unparseable())?;

    let id = match parsed.reply_id {
        Some(Value::String(id)) => id.trim().to_owned(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(unparseable()),
    };

    if !candidates.iter().any(|entry| entry.external_id == id) {
        return Err(AttemptProblem::UnknownEntry(id));
    }

    Ok(Verdict {
        entry_id: id,
        reasoning: parsed.reason.filter(|reason| !reason.trim().is_empty()),
    })
}

fn abbreviate(answer: &str) -> String {
    const LIMIT: usize = 120;
    match answer.char_indices().nth(LIMIT) {
        Some((cut, _)) => format!("{}...", &answer[..cut]),
        None => answer.to_owned(),
    }
}
