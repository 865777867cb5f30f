//! Conversation history window.

use crate::llm::ChatMessage;
use serde::{Deserialize, Serialize};

/// Bounded conversation window. `questions` ends with the current question;
/// `answers` holds prior answers, so it is one entry shorter when aligned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationHistory {
    pub questions: Vec<String>,
    pub answers: Vec<String>,
}

impl ConversationHistory {
    pub fn new(questions: Vec<String>, answers: Vec<String>) -> Self {
        Self { questions, answers }
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// The question being answered in this turn.
    pub fn current_question(&self) -> Option<&str> {
        self.questions.last().map(|s| s.as_str())
    }

    /// All questions before the current one.
    pub fn previous_questions(&self) -> &[String] {
        if self.questions.is_empty() {
            &[]
        } else {
            &self.questions[..self.questions.len() - 1]
        }
    }

    /// Truncate to the most recent `max_questions` questions, keeping the
    /// trailing question/answer alignment (answers cap at one fewer).
    pub fn truncate(&mut self, max_questions: usize) {
        if self.questions.len() > max_questions {
            self.questions = self
                .questions
                .split_off(self.questions.len() - max_questions);
        }

        let max_answers = max_questions.saturating_sub(1);
        if self.answers.len() > max_answers {
            self.answers = self.answers.split_off(self.answers.len() - max_answers);
        }
    }

    /// Build the conversational message buffer from completed turns:
    /// prior questions paired with their answers, in order. The current
    /// question is not included; agents append it with their own prompt.
    pub fn message_buffer(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for (question, answer) in self.previous_questions().iter().zip(self.answers.iter()) {
            messages.push(ChatMessage::user(question.clone()));
            messages.push(ChatMessage::assistant(answer.clone()));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n_questions: usize, n_answers: usize) -> ConversationHistory {
        ConversationHistory::new(
            (0..n_questions).map(|i| format!("q{}", i)).collect(),
            (0..n_answers).map(|i| format!("a{}", i)).collect(),
        )
    }

    #[test]
    fn test_truncate_keeps_trailing_alignment() {
        let mut h = history(9, 8);
        h.truncate(5);
        assert_eq!(h.questions.len(), 5);
        assert_eq!(h.answers.len(), 4);
        // Most recent entries are kept
        assert_eq!(h.questions.last().unwrap(), "q8");
        assert_eq!(h.answers.last().unwrap(), "a7");
    }

    #[test]
    fn test_truncate_noop_when_short() {
        let mut h = history(3, 2);
        h.truncate(5);
        assert_eq!(h.questions.len(), 3);
        assert_eq!(h.answers.len(), 2);
    }

    #[test]
    fn test_truncate_to_single_question_drops_all_answers() {
        let mut h = history(4, 3);
        h.truncate(1);
        assert_eq!(h.questions.len(), 1);
        assert!(h.answers.is_empty());
    }

    #[test]
    fn test_message_buffer_pairs_turns() {
        let h = history(3, 2);
        let buffer = h.message_buffer();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer[0].role, "user");
        assert_eq!(buffer[0].content, "q0");
        assert_eq!(buffer[1].role, "assistant");
        assert_eq!(buffer[1].content, "a0");
        assert_eq!(buffer[3].content, "a1");
    }

    #[test]
    fn test_current_and_previous_questions() {
        let h = history(3, 2);
        assert_eq!(h.current_question(), Some("q2"));
        assert_eq!(h.previous_questions(), &["q0".to_string(), "q1".to_string()]);
    }
}
