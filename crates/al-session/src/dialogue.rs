//! Console dialogue: asks the person at the terminal for a label.

use async_trait::async_trait;
use coordination::LabelLinker;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::debug;

use crate::resolution::DialogueService;

/// Text dialogue over any line-oriented async reader (stdin by default).
///
/// The committee's distinct suggestions are shown as numbered human phrases.
/// The answer may be a suggestion number, a human phrase, or a model label.
pub struct ConsoleDialogue<R> {
    linker: LabelLinker,
    input: Mutex<Lines<R>>,
}

impl ConsoleDialogue<BufReader<Stdin>> {
    pub fn stdin(linker: LabelLinker) -> Self {
        Self::new(linker, BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin + Send> ConsoleDialogue<R> {
    pub fn new(linker: LabelLinker, reader: R) -> Self {
        Self {
            linker,
            input: Mutex::new(reader.lines()),
        }
    }

    /// Map an answer to a model label.
    fn interpret(&self, answer: &str, suggestions: &[String]) -> Option<String> {
        let answer = answer.trim();
        if let Ok(choice) = answer.parse::<usize>() {
            if (1..=suggestions.len()).contains(&choice) {
                return Some(suggestions[choice - 1].clone());
            }
        }
        self.linker.from_human(answer)
    }
}

/// Distinct labels in first-seen order.
fn distinct(votes: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(votes.len());
    for vote in votes {
        if !seen.contains(vote) {
            seen.push(vote.clone());
        }
    }
    seen
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> DialogueService for ConsoleDialogue<R> {
    async fn start_query(&self, votes: &[String]) -> anyhow::Result<String> {
        let suggestions = distinct(votes);
        let mut input = self.input.lock().await;

        println!("I'm not sure what you are doing right now. Are you:");
        for (i, label) in suggestions.iter().enumerate() {
            println!("  {}) {}", i + 1, self.linker.to_human(label));
        }
        loop {
            println!("Enter a number or describe the activity:");
            let Some(line) = input.next_line().await? else {
                anyhow::bail!("dialogue input closed before an answer was given");
            };
            if let Some(label) = self.interpret(&line, &suggestions) {
                debug!(answer = %line.trim(), %label, "Dialogue answered");
                println!("Thanks, noted: {}", self.linker.to_human(&label));
                return Ok(label);
            }
            println!("Sorry, I didn't recognise {:?}.", line.trim());
        }
    }
}
