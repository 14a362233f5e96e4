//! Interactive questions on the terminal

use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

use crate::Error;

pub trait Prompt {
    /// Print `question` and return the trimmed answer
    fn ask(&mut self, question: &str) -> Result<String, Error>;
}

/// Reads answers from standard input
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn ask(&mut self, question: &str) -> Result<String, Error> {
        print!("{}", question);
        io::stdout().flush()?;

        let mut answer = String::new();
        let read = io::stdin().lock().read_line(&mut answer)?;
        if read == 0 {
            // EOF on a closed terminal counts as declining
            return Err(Error::Aborted);
        }
        Ok(answer.trim().to_string())
    }
}

/// Replays canned answers, for tests and non-interactive callers
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<String>,
    pub asked: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn ask(&mut self, question: &str) -> Result<String, Error> {
        self.asked.push(question.to_string());
        self.answers.pop_front().ok_or(Error::Aborted)
    }
}

/// Ask a yes/no question; an empty answer picks `default`
pub fn confirm(prompt: &mut dyn Prompt, question: &str, default: bool) -> Result<bool, Error> {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    loop {
        let answer = prompt.ask(&format!("{} {} ", question, hint))?;
        match answer.to_ascii_lowercase().as_str() {
            "" => return Ok(default),
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("Please answer y or n."),
        }
    }
}

/// Ask for a value, returning `default` on an empty answer
pub fn ask_with_default(
    prompt: &mut dyn Prompt,
    question: &str,
    default: &str,
) -> Result<String, Error> {
    let answer = if default.is_empty() {
        prompt.ask(&format!("{}: ", question))?
    } else {
        prompt.ask(&format!("{} [{}]: ", question, default))?
    };
    Ok(if answer.is_empty() {
        default.to_string()
    } else {
        answer
    })
}

/// Keep asking until `parse` accepts the answer
pub fn ask_until<T, F>(
    prompt: &mut dyn Prompt,
    question: &str,
    default: &str,
    mut parse: F,
) -> Result<T, Error>
where
    F: FnMut(&str) -> Result<T, String>,
{
    loop {
        let answer = ask_with_default(prompt, question, default)?;
        match parse(&answer) {
            Ok(value) => return Ok(value),
            Err(msg) => println!("{}", msg),
        }
    }
}
