use futures::{Stream, StreamExt};
use immix_llm::{Fragment, UNTERMINATED_STREAM_REASON};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How a generation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Done,
    Error(String),
}

/// What the accumulation path hands to persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulated {
    /// Exact concatenation of every text fragment before the terminal.
    pub text: String,
    pub terminal: Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeeOutcome {
    pub accumulated: Accumulated,
    /// False once the caller stopped receiving before the terminal record.
    pub wire_delivered: bool,
    pub fragments_read: usize,
}

/// The two consumption views of one fragment sequence.
///
/// `wire` sees every fragment, terminal included, as soon as it is read.
/// `completion` resolves once the source is drained, whether or not anyone is
/// still reading `wire`.
pub struct Tee {
    pub wire: mpsc::UnboundedReceiver<Fragment>,
    pub completion: TeeCompletion,
}

pub struct TeeCompletion {
    pump: JoinHandle<PumpReport>,
    accumulator: JoinHandle<Accumulated>,
}

#[derive(Debug, Clone, Copy)]
struct PumpReport {
    wire_delivered: bool,
    fragments_read: usize,
}

/// Splits `source` into a wire view and an accumulator.
///
/// A single pump task is the only reader of `source`. It forwards each fragment
/// to both views; a closed wire channel is recorded and ignored so a caller
/// disconnect never stops the accumulator from reaching the terminal.
pub fn tee<S>(source: S) -> Tee
where
    S: Stream<Item = Fragment> + Send + Unpin + 'static,
{
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let (accumulate_tx, accumulate_rx) = mpsc::unbounded_channel();

    let pump = tokio::spawn(run_pump(source, wire_tx, accumulate_tx));
    let accumulator = tokio::spawn(run_accumulator(accumulate_rx));

    Tee {
        wire: wire_rx,
        completion: TeeCompletion { pump, accumulator },
    }
}

async fn run_pump<S>(
    mut source: S,
    wire_tx: mpsc::UnboundedSender<Fragment>,
    accumulate_tx: mpsc::UnboundedSender<Fragment>,
) -> PumpReport
where
    S: Stream<Item = Fragment> + Unpin,
{
    let mut report = PumpReport {
        wire_delivered: true,
        fragments_read: 0,
    };

    while let Some(fragment) = source.next().await {
        report.fragments_read += 1;
        let terminal = fragment.is_terminal();

        if report.wire_delivered && wire_tx.send(fragment.clone()).is_err() {
            report.wire_delivered = false;
            tracing::info!(
                fragments_read = report.fragments_read,
                "caller stopped reading; continuing to drain generation"
            );
        }
        if accumulate_tx.send(fragment).is_err() {
            tracing::warn!("accumulator ended before the source was drained");
        }
        if terminal {
            break;
        }
    }

    report
}

async fn run_accumulator(mut fragments: mpsc::UnboundedReceiver<Fragment>) -> Accumulated {
    let mut text = String::new();
    while let Some(fragment) = fragments.recv().await {
        match fragment {
            Fragment::Text(chunk) => text.push_str(&chunk),
            Fragment::Done => {
                return Accumulated {
                    text,
                    terminal: Terminal::Done,
                };
            }
            Fragment::Error(reason) => {
                return Accumulated {
                    text,
                    terminal: Terminal::Error(reason),
                };
            }
        }
    }

    Accumulated {
        text,
        terminal: Terminal::Error(UNTERMINATED_STREAM_REASON.to_string()),
    }
}

impl TeeCompletion {
    pub async fn wait(self) -> TeeOutcome {
        let report = match self.pump.await {
            Ok(report) => report,
            Err(error) => {
                tracing::error!(error = %error, "tee pump task failed");
                PumpReport {
                    wire_delivered: false,
                    fragments_read: 0,
                }
            }
        };
        let accumulated = match self.accumulator.await {
            Ok(accumulated) => accumulated,
            Err(error) => {
                tracing::error!(error = %error, "tee accumulator task failed");
                Accumulated {
                    text: String::new(),
                    terminal: Terminal::Error("accumulator task failed".to_string()),
                }
            }
        };

        TeeOutcome {
            accumulated,
            wire_delivered: report.wire_delivered,
            fragments_read: report.fragments_read,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use immix_llm::{GenerationParams, Generator, ScriptedGenerator};

    use super::*;

    fn start(generator: &ScriptedGenerator) -> Tee {
        let handle = generator
            .generate("user: hi".to_string(), GenerationParams::default())
            .unwrap();
        tokio::spawn(handle.worker);
        tee(handle.stream)
    }

    fn wire_text(fragments: &[Fragment]) -> String {
        fragments
            .iter()
            .filter_map(|fragment| match fragment {
                Fragment::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn both_views_see_the_same_text() {
        let generator = ScriptedGenerator::completing(["Hel", "lo", "!"]);
        let mut tee = start(&generator);

        let mut wire = Vec::new();
        while let Some(fragment) = tee.wire.recv().await {
            wire.push(fragment);
        }
        let outcome = tee.completion.wait().await;

        assert_eq!(wire.last(), Some(&Fragment::Done));
        assert_eq!(wire_text(&wire), outcome.accumulated.text);
        assert_eq!(outcome.accumulated.text, "Hello!");
        assert_eq!(outcome.accumulated.terminal, Terminal::Done);
        assert!(outcome.wire_delivered);
        assert_eq!(outcome.fragments_read, 4);
    }

    #[tokio::test]
    async fn keeps_partial_text_when_generation_fails() {
        let generator = ScriptedGenerator::failing(["par", "tial"], "engine died");
        let mut tee = start(&generator);

        let mut wire = Vec::new();
        while let Some(fragment) = tee.wire.recv().await {
            wire.push(fragment);
        }
        let outcome = tee.completion.wait().await;

        assert_eq!(wire.last(), Some(&Fragment::Error("engine died".to_string())));
        assert_eq!(outcome.accumulated.text, "partial");
        assert_eq!(
            outcome.accumulated.terminal,
            Terminal::Error("engine died".to_string())
        );
    }

    #[tokio::test]
    async fn disconnect_does_not_stop_accumulation() {
        let generator = ScriptedGenerator::completing(["one ", "two ", "three"])
            .with_fragment_delay(Duration::from_millis(10));
        let mut tee = start(&generator);

        assert_eq!(
            tee.wire.recv().await,
            Some(Fragment::Text("one ".to_string()))
        );
        drop(tee.wire);

        let outcome = tee.completion.wait().await;
        assert_eq!(outcome.accumulated.text, "one two three");
        assert_eq!(outcome.accumulated.terminal, Terminal::Done);
        assert!(!outcome.wire_delivered);
        assert_eq!(outcome.fragments_read, 4);
    }
}
