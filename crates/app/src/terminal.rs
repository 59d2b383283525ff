use std::io::{self, Write};
use std::sync::Arc;

use sahai_chat::{ConversationSnapshot, ConversationStore, Message, MessageId, Role, SendOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

pub const QUIT_COMMAND: &str = "/quit";
const THINKING_TEXT: &str = "Sah.ai is thinking...";

struct PrintedMessage {
    id: MessageId,
    len: usize,
}

/// Incremental plain-text view of the conversation.
///
/// Messages are printed once; only the last one may keep growing while a
/// reply streams in. Messages removed from the conversation stay on screen.
#[derive(Default)]
pub struct Transcript {
    printed: Vec<PrintedMessage>,
    line_open: bool,
    thinking_shown: bool,
}

impl Transcript {
    pub fn render(&mut self, snapshot: &ConversationSnapshot, out: &mut impl Write) -> io::Result<()> {
        let visible: Vec<&Message> = snapshot
            .messages
            .iter()
            .filter(|message| message.is_renderable())
            .collect();

        let shared = self
            .printed
            .iter()
            .zip(&visible)
            .take_while(|(printed, message)| printed.id == message.id)
            .count();
        if shared < self.printed.len() {
            self.close_line(out)?;
            self.printed.truncate(shared);
        }

        if let Some(last) = shared.checked_sub(1) {
            let content = &visible[last].content;
            let printed = &mut self.printed[last];
            if self.line_open
                && let Some(suffix) = content.get(printed.len..)
                && !suffix.is_empty()
            {
                out.write_all(suffix.as_bytes())?;
                printed.len = content.len();
            }
        }

        for message in &visible[shared..] {
            self.close_line(out)?;
            write!(out, "{} {}", label(message.role), message.content)?;
            self.printed.push(PrintedMessage {
                id: message.id.clone(),
                len: message.content.len(),
            });
            self.line_open = true;
        }

        if snapshot.is_loading {
            let streaming = snapshot
                .messages
                .last()
                .is_some_and(|message| message.role == Role::Model && message.is_renderable());
            if !snapshot.messages.is_empty() && !streaming && !self.thinking_shown {
                self.close_line(out)?;
                writeln!(out, "  ({THINKING_TEXT})")?;
                self.thinking_shown = true;
            }
        } else {
            self.thinking_shown = false;
            self.close_line(out)?;
        }

        out.flush()
    }

    fn close_line(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.line_open {
            writeln!(out)?;
            self.line_open = false;
        }
        Ok(())
    }
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you:",
        Role::Model => "sah.ai:",
        Role::Error => "(!)",
    }
}

/// Redraws on every snapshot change; renders the latest state once more when
/// `shutdown` fires.
pub fn spawn_renderer(
    mut updates: watch::Receiver<ConversationSnapshot>,
    mut shutdown: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut transcript = Transcript::default();
        loop {
            let snapshot = updates.borrow_and_update().clone();
            if let Err(error) = transcript.render(&snapshot, &mut io::stdout().lock()) {
                tracing::warn!(error = %error, "failed to write transcript");
                return;
            }

            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = &mut shutdown => {
                    let snapshot = updates.borrow().clone();
                    if let Err(error) = transcript.render(&snapshot, &mut io::stdout().lock()) {
                        tracing::warn!(error = %error, "failed to write transcript");
                    }
                    return;
                }
            }
        }
    })
}

/// Reads lines from stdin and sends each to the store until `/quit` or EOF.
pub async fn run_input_loop(store: Arc<ConversationStore>) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = store.subscribe();

    while let Some(line) = lines.next_line().await? {
        let text = line.trim_end_matches('\r');
        if text.trim() == QUIT_COMMAND {
            break;
        }
        if text.trim().is_empty() {
            continue;
        }

        // Lines typed during a reply are queued until it finishes.
        if updates
            .wait_for(|snapshot| !snapshot.is_loading)
            .await
            .is_err()
        {
            break;
        }

        match store.send_message(text).await {
            SendOutcome::Busy => {
                println!("  (Sah.ai is busy right now, please send that again in a moment.)");
            }
            outcome => tracing::debug!(?outcome, "message handled"),
        }
    }

    Ok(())
}
