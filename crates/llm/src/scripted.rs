use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use super::error::GeneratorResult;
use super::fragment::{Fragment, GenerationParams};
use super::generator::{
    FragmentSender, GenerationHandle, Generator, GeneratorWorker, make_fragment_stream,
};

/// Deterministic generator that replays a fixed fragment script.
///
/// Used to drive the pipeline in tests: the script may end without a terminal
/// marker, and an optional per-fragment delay makes mid-stream disconnects
/// reproducible.
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Vec<Fragment>,
    fragment_delay: Duration,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Fragment>) -> Self {
        Self {
            script,
            fragment_delay: Duration::ZERO,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Text fragments followed by [`Fragment::Done`].
    pub fn completing<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script: Vec<Fragment> = texts
            .into_iter()
            .map(|text| Fragment::Text(text.into()))
            .collect();
        script.push(Fragment::Done);
        Self::new(script)
    }

    /// Text fragments followed by [`Fragment::Error`].
    pub fn failing<I, S>(texts: I, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut script: Vec<Fragment> = texts
            .into_iter()
            .map(|text| Fragment::Text(text.into()))
            .collect();
        script.push(Fragment::Error(reason.into()));
        Self::new(script)
    }

    pub fn with_fragment_delay(mut self, fragment_delay: Duration) -> Self {
        self.fragment_delay = fragment_delay;
        self
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }

    async fn run_stream_worker(
        script: Vec<Fragment>,
        fragment_delay: Duration,
        sender: FragmentSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for fragment in script {
            if !fragment_delay.is_zero() {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep(fragment_delay) => {}
                }
            }
            if !sender.send(fragment).await {
                return;
            }
        }
    }
}

impl Generator for ScriptedGenerator {
    fn id(&self) -> &str {
        "scripted"
    }

    fn generate(
        &self,
        prompt: String,
        _params: GenerationParams,
    ) -> GeneratorResult<GenerationHandle> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt);
        }

        let (sender, stream, cancel_rx) = make_fragment_stream();
        let worker: GeneratorWorker = Box::pin(Self::run_stream_worker(
            self.script.clone(),
            self.fragment_delay,
            sender,
            cancel_rx,
        ));

        Ok(GenerationHandle { stream, worker })
    }
}
