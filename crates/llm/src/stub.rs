use std::sync::Arc;
use std::time::Duration;

use snafu::ensure;
use tokio::sync::oneshot;

use super::error::{EmptyPromptSnafu, GeneratorResult};
use super::fragment::GenerationParams;
use super::generator::{
    FragmentSender, GenerationHandle, Generator, GeneratorWorker, make_fragment_stream,
};
use super::model::ModelHandle;

pub const STUB_PROVIDER_ID: &str = "stub";

const USER_LINE_PREFIX: &str = "user: ";
const DEFAULT_WORD_DELAY: Duration = Duration::from_millis(30);

/// Engine-free generator that echoes the last user turn word by word.
pub struct StubGenerator {
    models: Arc<ModelHandle>,
    word_delay: Duration,
}

impl StubGenerator {
    pub fn new(models: Arc<ModelHandle>) -> Self {
        tracing::info!("creating stub generator (no engine attached)");
        Self {
            models,
            word_delay: DEFAULT_WORD_DELAY,
        }
    }

    pub fn with_word_delay(mut self, word_delay: Duration) -> Self {
        self.word_delay = word_delay;
        self
    }

    /// Text the stub answers with for `prompt`.
    pub fn reply_for(model_id: &str, prompt: &str) -> String {
        let last_user_turn = prompt
            .rmatch_indices(USER_LINE_PREFIX)
            .find(|(index, _)| *index == 0 || prompt[..*index].ends_with('\n'))
            .map(|(index, _)| &prompt[index + USER_LINE_PREFIX.len()..])
            .unwrap_or(prompt);
        // Drop any turns recorded after the last user turn.
        let last_user_turn = last_user_turn
            .split("\nassistant: ")
            .next()
            .unwrap_or(last_user_turn)
            .trim();

        format!("[{model_id}] You said: {last_user_turn}")
    }

    async fn run_stream_worker(
        reply: String,
        word_delay: Duration,
        sender: FragmentSender,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for word in reply.split_inclusive(' ') {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!("stub generation cancelled");
                    return;
                }
                _ = tokio::time::sleep(word_delay) => {}
            }
            if !sender.text(word).await {
                return;
            }
        }
        sender.done().await;
    }
}

impl Generator for StubGenerator {
    fn id(&self) -> &str {
        STUB_PROVIDER_ID
    }

    fn generate(
        &self,
        prompt: String,
        _params: GenerationParams,
    ) -> GeneratorResult<GenerationHandle> {
        ensure!(
            !prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "stub-generate"
            }
        );

        let reply = Self::reply_for(&self.models.current(), &prompt);
        let (sender, stream, cancel_rx) = make_fragment_stream();
        let worker: GeneratorWorker = Box::pin(Self::run_stream_worker(
            reply,
            self.word_delay,
            sender,
            cancel_rx,
        ));

        Ok(GenerationHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Fragment;

    #[test]
    fn echoes_the_last_user_turn() {
        let prompt = "system: be brief\nuser: first\nassistant: ok\nuser: second question";
        assert_eq!(
            StubGenerator::reply_for("m", prompt),
            "[m] You said: second question"
        );
        assert_eq!(StubGenerator::reply_for("m", "no tags"), "[m] You said: no tags");
    }

    #[tokio::test]
    async fn streams_words_that_concatenate_to_the_reply() {
        let models = Arc::new(ModelHandle::new("m", Vec::new()).unwrap());
        let generator = StubGenerator::new(models).with_word_delay(Duration::ZERO);
        let handle = generator
            .generate("user: hi there".to_string(), GenerationParams::default())
            .unwrap();
        tokio::spawn(handle.worker);

        let fragments: Vec<Fragment> = handle.stream.collect().await;
        let (last, texts) = fragments.split_last().unwrap();
        assert_eq!(last, &Fragment::Done);

        let joined: String = texts
            .iter()
            .map(|fragment| match fragment {
                Fragment::Text(text) => text.as_str(),
                other => panic!("unexpected fragment {other:?}"),
            })
            .collect();
        assert_eq!(joined, "[m] You said: hi there");
        assert!(texts.len() > 1);
    }
}
