//! Contest catalog: prompt bodies, judging instructions and announcements.

use std::time::Duration;

use rand::seq::IndexedRandom;

use crate::dao::models::{Entry, GameType};

/// Standing instructions given to the judge on every call.
pub const JUDGE_CONTEXT: &str = "This is a game where many players participate by replying with \
creative answers and their wallet addresses. You are a fair and witty game judge: evaluate each \
response with focus on creativity, emotion, and adherence to the game rules. Answer with a single \
JSON object of the form {\"reply_id\": \"<id of the winning entry>\", \"reason\": \"<short explanation>\"}.";

struct Card {
    title: &'static str,
    reply: &'static str,
    rule: &'static str,
    instructions: &'static str,
}

fn card(game_type: GameType) -> Card {
    match game_type {
        GameType::FunFact => Card {
            title: "Fun Fact",
            reply: "An interesting and little-known fact.",
            rule: "The most fascinating fact wins.",
            instructions: "pick the entry with the most interesting fact.",
        },
        GameType::EmojiStory => Card {
            title: "Emoji Story",
            reply: "With a short story using only emojis.",
            rule: "The most creative emoji story wins.",
            instructions: "pick the entry with the most creative emoji story.",
        },
        GameType::BestJoke => Card {
            title: "Best Joke",
            reply: "Your best joke.",
            rule: "The best joke wins.",
            instructions: "pick the entry with the best joke.",
        },
        GameType::RandomWallet => Card {
            title: "Random Wallet",
            reply: "Submit your Solana wallet address.",
            rule: "A random selection will determine the winner.",
            instructions: "pick one entry at random, ignoring the content entirely.",
        },
        GameType::ImprovStory => Card {
            title: "Improv Story",
            reply: "Complete the story: \u{201c}Once upon a time\u{2026}",
            rule: "The most imaginative continuation wins.",
            instructions: "pick the entry with the most imaginative story continuation.",
        },
        GameType::AbstractPoetry => Card {
            title: "Abstract Poetry",
            reply: "Complete the poem: \u{201c}Under neon moons, the meme\u{2026}",
            rule: "The best poetic expression wins.",
            instructions: "pick the entry with the best poetic expression.",
        },
        GameType::CreativeChallenge => Card {
            title: "Creative Challenge",
            reply: "Propose your unique challenge.",
            rule: "The most intriguing challenge wins.",
            instructions: "pick the entry with the most intriguing creative challenge.",
        },
    }
}

/// Pick a game type uniformly from `enabled`, or from the whole catalog when it is empty.
pub fn choose_game_type(enabled: &[GameType]) -> GameType {
    let pool = if enabled.is_empty() {
        &GameType::ALL[..]
    } else {
        enabled
    };
    pool.choose(&mut rand::rng())
        .copied()
        .unwrap_or(GameType::FunFact)
}

/// Human-readable delay until the result, e.g. `In 90 minutes.`
pub fn result_time(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 120 {
        format!("In {secs} seconds.")
    } else {
        format!("In {} minutes.", secs / 60)
    }
}

/// Text of the post that opens a game.
pub fn compose_prompt(game_type: GameType, duration: Duration, prize: &str) -> String {
    let card = card(game_type);
    format!(
        "\u{1f380} /GAME OPEN \u{1f380}\n\
         \u{1f337} /GAME: {title}\n\
         \u{1f338} /REPLY: {reply}\n\
         \u{1f492} /RULE: {rule}\n\
         \u{1f48c} /INCLUDE: Your Solana wallet address.\n\
         \u{1f49d} /PRIZE: {prize}\n\
         \u{1f9a9} /RESULT: {result}",
        title = card.title,
        reply = card.reply,
        rule = card.rule,
        result = result_time(duration),
    )
}

/// Judging instructions for `game_type`, followed by the operator's custom ones.
pub fn judging_instructions(game_type: GameType, custom: Option<&str>) -> String {
    let base = card(game_type).instructions;
    match custom.map(str::trim).filter(|custom| !custom.is_empty()) {
        Some(custom) => format!("{base}\nAdditional instructions: {custom}"),
        None => base.to_owned(),
    }
}

/// Result post for a game closed with a winner.
pub fn winner_announcement(winner: &Entry) -> String {
    let who = match (&winner.author_username, &winner.wallet) {
        (_, Some(wallet)) => format!("\u{1f449} Wallet: {wallet}"),
        (Some(username), None) => format!("\u{1f449} @{username}"),
        (None, None) => format!("\u{1f449} Reply {}", winner.external_id),
    };
    format!(
        "\u{1f3ae} GAME CLOSED \u{1f3ae}\n\n\
         \u{1f3c6} WINNER ANNOUNCED:\n\
         {who}\n\n\
         \u{1f389} CONGRATULATIONS!"
    )
}

/// Why a game closed without a winner, as told to the players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoWinnerReason {
    /// Nobody replied.
    NoReplies,
    /// Replies came in but none was valid.
    NoValidEntries,
    /// The judge did not settle on a valid entry.
    NoDecision,
}

/// Result post for a game closed without a winner.
pub fn no_winner_announcement(reason: NoWinnerReason) -> String {
    let detail = match reason {
        NoWinnerReason::NoReplies => "\u{26a0}\u{fe0f} NO REPLIES RECEIVED.\n\u{1f622} NO WINNER DECLARED.",
        NoWinnerReason::NoValidEntries => {
            "\u{26a0}\u{fe0f} NO VALID ENTRY FOUND.\n\u{1f641} PLEASE INCLUDE YOUR SOLANA WALLET ADDRESS NEXT TIME."
        }
        NoWinnerReason::NoDecision => {
            "\u{1f61e} NO IMPRESSIVE SUBMISSION RECEIVED.\n\u{1f641} NO WINNER DECLARED, BETTER LUCK NEXT TIME!"
        }
    };
    format!("\u{1f3ae} GAME CLOSED \u{1f3ae}\n\n{detail}")
}
