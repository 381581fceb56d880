use std::{
    io::{BufRead, Write},
    sync::Arc,
};

use log::warn;

/// Asks the operator a yes/no question.
pub type Confirm = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub fn always_approve() -> Confirm {
    Arc::new(|_| true)
}

pub fn stdin_confirm() -> Confirm {
    Arc::new(|message| {
        let mut stderr = std::io::stderr().lock();
        if write!(stderr, "{message} [y/N]: ").and_then(|_| stderr.flush()).is_err() {
            return false;
        }

        let mut answer = String::new();
        if let Err(error) = std::io::stdin().lock().read_line(&mut answer) {
            warn!("Couldn't read the answer: {error}");
            return false;
        }

        parse_answer(&answer)
    })
}

fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
