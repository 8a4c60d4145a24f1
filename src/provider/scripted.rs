//! Deterministic provider used by tests and `--dry-run`.
//!
//! Responses are scripted per unit id (exact id or id prefix) as a queue of
//! [`ScriptStep`]s consumed one per call; units without a script fall back to a
//! responder closure.

use crate::cancel::CancelToken;
use crate::error::ProviderError;
use crate::provider::{ChatMessage, GenerationParams, GenerationProvider, MessageRole, TokenStream};
use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One scripted provider call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Stream these tokens, then finish ok.
    Tokens(Vec<String>),
    /// Fail before any token is produced.
    Fail(ProviderError),
    /// Stream these tokens, then fail mid-stream.
    TokensThenFail(Vec<String>, ProviderError),
    /// Stream these tokens, then never finish.
    Stall(Vec<String>),
}

impl ScriptStep {
    /// Split `text` into whitespace-preserving word tokens.
    pub fn text(text: &str) -> Self {
        ScriptStep::Tokens(tokenize(text))
    }
}

/// A call observed by the provider.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub unit_id: String,
    pub temperature: f32,
    pub prompt: String,
}

struct Rule {
    pattern: String,
    prefix: bool,
    steps: VecDeque<ScriptStep>,
}

type Responder = dyn Fn(&[ChatMessage], &GenerationParams) -> String + Send + Sync;

pub struct ScriptedProvider {
    rules: Mutex<Vec<Rule>>,
    responder: Box<Responder>,
    token_delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&[ChatMessage], &GenerationParams) -> String + Send + Sync + 'static,
    {
        Self {
            rules: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            token_delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Echoes the request back inside a two-phase scaffold, so every default
    /// stage (including phase extraction) has usable input.
    pub fn echo() -> Self {
        Self::new(|messages, params| {
            let excerpt = messages
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .and_then(|m| m.content.lines().find(|l| !l.trim().is_empty()))
                .unwrap_or("")
                .trim()
                .to_string();
            format!(
                "# {}\n\n{}\n\n## Phase 1: Foundations\n\nSet up the groundwork.\n\nAcceptance criteria:\n- Groundwork exists\n\n## Phase 2: Delivery\n\nShip the result.\n\nAcceptance criteria:\n- Result is shipped\n",
                params.unit_id, excerpt
            )
        })
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = Some(delay);
        self
    }

    /// Script the calls made for exactly `unit_id`.
    pub fn script(self, unit_id: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        self.rules.lock().push(Rule {
            pattern: unit_id.into(),
            prefix: false,
            steps: steps.into(),
        });
        self
    }

    /// Script the calls made for any unit id starting with `prefix`.
    pub fn script_prefix(self, prefix: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        self.rules.lock().push(Rule {
            pattern: prefix.into(),
            prefix: true,
            steps: steps.into(),
        });
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, unit_id: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.unit_id == unit_id)
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open streams seen so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, messages: &[ChatMessage], params: &GenerationParams) -> ScriptStep {
        let mut rules = self.rules.lock();
        let exact = rules
            .iter()
            .position(|r| !r.prefix && r.pattern == params.unit_id && !r.steps.is_empty());
        let chosen = exact.or_else(|| {
            rules
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.prefix && params.unit_id.starts_with(&r.pattern) && !r.steps.is_empty()
                })
                .max_by_key(|(_, r)| r.pattern.len())
                .map(|(i, _)| i)
        });
        let scripted = chosen.and_then(|i| rules[i].steps.pop_front());
        drop(rules);
        scripted.unwrap_or_else(|| ScriptStep::text(&(self.responder)(messages, params)))
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Tail {
    Done,
    Fail(ProviderError),
    Stall,
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    async fn submit(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
        _cancel: &CancelToken,
    ) -> Result<TokenStream, ProviderError> {
        self.calls.lock().push(RecordedCall {
            unit_id: params.unit_id.clone(),
            temperature: params.temperature,
            prompt: messages
                .iter()
                .rev()
                .find(|m| m.role == MessageRole::User)
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        });

        let (tokens, tail) = match self.next_step(messages, params) {
            ScriptStep::Fail(err) => return Err(err),
            ScriptStep::Tokens(tokens) => (tokens, Tail::Done),
            ScriptStep::TokensThenFail(tokens, err) => (tokens, Tail::Fail(err)),
            ScriptStep::Stall(tokens) => (tokens, Tail::Stall),
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlightGuard(self.in_flight.clone());
        let delay = self.token_delay;

        let state = (VecDeque::from(tokens), Some(tail), guard);
        Ok(Box::pin(stream::unfold(
            state,
            move |(mut tokens, mut tail, guard)| async move {
                if let Some(token) = tokens.pop_front() {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    return Some((Ok(token), (tokens, tail, guard)));
                }
                match tail.take()? {
                    Tail::Done => None,
                    Tail::Fail(err) => Some((Err(err), (tokens, None, guard))),
                    Tail::Stall => {
                        futures::future::pending::<()>().await;
                        None
                    }
                }
            },
        )))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

/// Split text into tokens that concatenate back to the original.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use futures::StreamExt;

    fn params(unit_id: &str) -> GenerationParams {
        GenerationParams {
            unit_id: unit_id.to_string(),
            model: "test".to_string(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    async fn collect(stream: TokenStream) -> (String, Option<ProviderError>) {
        let mut text = String::new();
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(token) => text.push_str(&token),
                Err(err) => return (text, Some(err)),
            }
        }
        (text, None)
    }

    #[test]
    fn tokenize_round_trips_text() {
        let tokens = tokenize("hello  world\nnext");
        assert_eq!(tokens.concat(), "hello  world\nnext");
        assert_eq!(tokens[0], "hello ");
    }

    #[tokio::test]
    async fn scripted_steps_are_consumed_in_order_then_fall_back() {
        let provider = ScriptedProvider::new(|_, _| "fallback".to_string()).script(
            "run/design",
            vec![
                ScriptStep::Fail(ProviderError::rate_limit("slow")),
                ScriptStep::TokensThenFail(vec!["par".into()], ProviderError::network("reset")),
                ScriptStep::text("final answer"),
            ],
        );
        let cancel = CancelToken::new();
        let p = params("run/design");

        let first = provider.submit(&[], &p, &cancel).await;
        assert_eq!(first.err().unwrap().kind, ProviderErrorKind::RateLimit);

        let (text, err) = collect(provider.submit(&[], &p, &cancel).await.unwrap()).await;
        assert_eq!(text, "par");
        assert_eq!(err.unwrap().kind, ProviderErrorKind::TransientNetwork);

        let (text, err) = collect(provider.submit(&[], &p, &cancel).await.unwrap()).await;
        assert_eq!(text, "final answer");
        assert!(err.is_none());

        let (text, _) = collect(provider.submit(&[], &p, &cancel).await.unwrap()).await;
        assert_eq!(text, "fallback");
        assert_eq!(provider.calls_for("run/design"), 4);
    }

    #[tokio::test]
    async fn longest_prefix_rule_wins() {
        let provider = ScriptedProvider::new(|_, _| String::new())
            .script_prefix("run/", vec![ScriptStep::text("short")])
            .script_prefix("run/plan/", vec![ScriptStep::text("long")]);
        let cancel = CancelToken::new();
        let (text, _) = collect(
            provider
                .submit(&[], &params("run/plan/phase-1"), &cancel)
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(text, "long");
    }

    #[tokio::test]
    async fn in_flight_tracks_open_streams() {
        let provider = ScriptedProvider::echo();
        let cancel = CancelToken::new();
        let a = provider.submit(&[], &params("a"), &cancel).await.unwrap();
        let b = provider.submit(&[], &params("b"), &cancel).await.unwrap();
        assert_eq!(provider.in_flight(), 2);
        drop(a);
        collect(b).await;
        assert_eq!(provider.in_flight(), 0);
        assert_eq!(provider.max_in_flight(), 2);
    }
}
