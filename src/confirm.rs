//! Confirmation gates in front of destructive actions
//!
//! A gate always shows what will be affected before it accepts an answer,
//! and only an exact match of the required token counts as approval. Where
//! the answer comes from is pluggable: a terminal, a pre-supplied script, or
//! the non-interactive bypass flag.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tracing::{info, warn};

use crate::{Error, Result};

/// Token required unless a request sets its own
pub const DEFAULT_TOKEN: &str = "yes";

/// Number of prompts a confirmation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// One prompt
    Single,
    /// Two sequential prompts
    Double,
}

/// One prompt: what will happen, to which resources, and the answer required.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    /// What the action does
    pub description: String,
    /// Every resource the action affects; must not be empty
    pub resources: Vec<String>,
    /// Exact response that approves
    pub token: String,
    /// Severity of the confirmation this request belongs to
    pub severity: Severity,
}

impl ConfirmationRequest {
    /// Single-severity request approved by [`DEFAULT_TOKEN`]
    pub fn new(description: impl Into<String>, resources: Vec<String>) -> Self {
        Self {
            description: description.into(),
            resources,
            token: DEFAULT_TOKEN.to_string(),
            severity: Severity::Single,
        }
    }

    /// Require a different approval token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }
}

/// A complete confirmation: one prompt or two in sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// One prompt
    Single(ConfirmationRequest),
    /// Two prompts; the second is only shown if the first is approved
    Double(ConfirmationRequest, ConfirmationRequest),
}

impl Confirmation {
    /// Single confirmation
    pub fn single(request: ConfirmationRequest) -> Self {
        Confirmation::Single(request)
    }

    /// Double confirmation; both requests are marked [`Severity::Double`]
    pub fn double(mut first: ConfirmationRequest, mut second: ConfirmationRequest) -> Self {
        first.severity = Severity::Double;
        second.severity = Severity::Double;
        Confirmation::Double(first, second)
    }

    /// Severity of this confirmation
    pub fn severity(&self) -> Severity {
        match self {
            Confirmation::Single(_) => Severity::Single,
            Confirmation::Double(..) => Severity::Double,
        }
    }
}

/// How a gate resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Every prompt got the required token
    Approved,
    /// A prompt got anything else
    Declined,
}

impl Decision {
    /// Whether the decision is approval
    pub fn is_approved(self) -> bool {
        self == Decision::Approved
    }
}

/// Source of answers for a gate.
#[async_trait]
pub trait ConfirmationInput: Send {
    /// Show `prompt` and return the raw answer. `token` is what approval looks like.
    async fn respond(&mut self, prompt: &str, token: &str) -> Result<String>;
}

/// Reads answers from the terminal; waits indefinitely.
///
/// One buffered reader lives as long as the input, so answers piped ahead of
/// time are not dropped between prompts.
#[derive(Debug)]
pub struct TerminalInput<R = BufReader<Stdin>, W = Stdout> {
    reader: R,
    writer: W,
}

impl TerminalInput {
    /// Prompt on stdout, read answers from stdin
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl Default for TerminalInput {
    fn default() -> Self {
        Self::stdio()
    }
}

impl<R, W> TerminalInput<R, W> {
    /// Prompt on `writer`, read answers line by line from `reader`
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

#[async_trait]
impl<R, W> ConfirmationInput for TerminalInput<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn respond(&mut self, prompt: &str, _token: &str) -> Result<String> {
        self.writer.write_all(prompt.as_bytes()).await?;
        self.writer.flush().await?;

        // end of input reads as an empty answer, which declines
        let mut input = String::new();
        self.reader.read_line(&mut input).await?;
        Ok(input)
    }
}

/// Approves everything (bypass flag). The prompt is still logged.
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationInput for AutoApprove {
    async fn respond(&mut self, prompt: &str, token: &str) -> Result<String> {
        for line in prompt.lines().filter(|l| !l.trim().is_empty()) {
            info!("{}", line);
        }
        warn!("Confirmation bypassed by --yes");
        Ok(token.to_string())
    }
}

/// Shared record of every prompt a [`ScriptedInput`] was shown.
#[derive(Debug, Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<String>>>);

impl Transcript {
    /// Prompts shown so far
    pub fn prompts(&self) -> Vec<String> {
        self.0.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn push(&self, prompt: &str) {
        if let Ok(mut prompts) = self.0.lock() {
            prompts.push(prompt.to_string());
        }
    }
}

/// Answers from a pre-supplied list, for non-interactive runs and tests.
///
/// Running out of answers counts as declining.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    answers: VecDeque<String>,
    transcript: Transcript,
}

impl ScriptedInput {
    /// Answer prompts with `answers`, in order
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: Transcript::default(),
        }
    }

    /// Handle to the prompts this input is shown
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }
}

#[async_trait]
impl ConfirmationInput for ScriptedInput {
    async fn respond(&mut self, prompt: &str, _token: &str) -> Result<String> {
        self.transcript.push(prompt);
        Ok(self.answers.pop_front().unwrap_or_default())
    }
}

/// Blocks destructive actions on explicit approval.
pub struct ConfirmationGate {
    input: Box<dyn ConfirmationInput>,
}

impl ConfirmationGate {
    /// Gate reading answers from `input`
    pub fn new(input: Box<dyn ConfirmationInput>) -> Self {
        Self { input }
    }

    /// Interactive terminal gate, or auto-approving when `assume_yes`
    pub fn interactive(assume_yes: bool) -> Self {
        if assume_yes {
            Self::new(Box::new(AutoApprove))
        } else {
            Self::new(Box::new(TerminalInput::stdio()))
        }
    }

    /// Resolve `confirmation`. For [`Confirmation::Double`], a decline at the
    /// first prompt returns immediately without showing the second.
    pub async fn confirm(&mut self, confirmation: &Confirmation) -> Result<Decision> {
        match confirmation {
            Confirmation::Single(request) => self.ask(request, None).await,
            Confirmation::Double(first, second) => {
                if self.ask(first, Some(1)).await? == Decision::Declined {
                    return Ok(Decision::Declined);
                }
                self.ask(second, Some(2)).await
            }
        }
    }

    async fn ask(&mut self, request: &ConfirmationRequest, stage: Option<u8>) -> Result<Decision> {
        if request.resources.is_empty() {
            return Err(Error::validation(format!(
                "refusing to ask for confirmation without a resource list: {}",
                request.description
            )));
        }

        let prompt = render(request, stage);
        let answer = self.input.respond(&prompt, &request.token).await?;
        let decision = if answer.trim() == request.token {
            Decision::Approved
        } else {
            Decision::Declined
        };
        info!(
            action = %request.description,
            stage = stage.unwrap_or(1),
            decision = ?decision,
            "Confirmation resolved"
        );
        Ok(decision)
    }
}

/// Text shown for a request: description, full resource list, required token
pub fn render(request: &ConfirmationRequest, stage: Option<u8>) -> String {
    let mut out = String::new();
    if let Some(stage) = stage {
        let _ = write!(out, "[confirmation {}/2] ", stage);
    }
    let _ = writeln!(out, "{}", request.description);
    let _ = writeln!(out);
    let _ = writeln!(out, "Affected ({}):", request.resources.len());
    for resource in &request.resources {
        let _ = writeln!(out, "  - {}", resource);
    }
    let _ = writeln!(out);
    let _ = write!(out, "Type '{}' to continue: ", request.token);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(description: &str, resources: &[&str]) -> ConfirmationRequest {
        ConfirmationRequest::new(
            description,
            resources.iter().map(|r| r.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn single_requires_exact_token() {
        for (answer, expected) in [
            ("yes", Decision::Approved),
            ("yes\n", Decision::Approved),
            ("y", Decision::Declined),
            ("YES", Decision::Declined),
            ("", Decision::Declined),
        ] {
            let mut gate = ConfirmationGate::new(Box::new(ScriptedInput::new([answer])));
            let decision = gate
                .confirm(&Confirmation::single(request("Apply plan", &["aws_instance.cp"])))
                .await
                .unwrap();
            assert_eq!(decision, expected, "answer {:?}", answer);
        }
    }

    #[tokio::test]
    async fn prompt_lists_resources_before_answer() {
        let input = ScriptedInput::new(["yes"]);
        let transcript = input.transcript();
        let mut gate = ConfirmationGate::new(Box::new(input));

        gate.confirm(&Confirmation::single(request(
            "Apply plan",
            &["aws_vpc.main", "aws_instance.cp[0]"],
        )))
        .await
        .unwrap();

        let prompts = transcript.prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("aws_vpc.main"));
        assert!(prompts[0].contains("aws_instance.cp[0]"));
        assert!(prompts[0].ends_with("Type 'yes' to continue: "));
    }

    #[tokio::test]
    async fn double_declined_first_never_asks_second() {
        let input = ScriptedInput::new(["no", "destroy"]);
        let transcript = input.transcript();
        let mut gate = ConfirmationGate::new(Box::new(input));

        let decision = gate
            .confirm(&Confirmation::double(
                request("Destroy infrastructure", &["aws_vpc.main"]),
                request("Load balancers removed?", &["svc/ingress"]).with_token("destroy"),
            ))
            .await
            .unwrap();

        assert_eq!(decision, Decision::Declined);
        assert_eq!(transcript.prompts().len(), 1);
    }

    #[tokio::test]
    async fn double_needs_both_approvals() {
        let input = ScriptedInput::new(["yes", "nope"]);
        let transcript = input.transcript();
        let mut gate = ConfirmationGate::new(Box::new(input));
        let confirmation = Confirmation::double(
            request("Destroy infrastructure", &["aws_vpc.main"]),
            request("Load balancers removed?", &["svc/ingress"]).with_token("destroy"),
        );
        assert_eq!(confirmation.severity(), Severity::Double);

        let decision = gate.confirm(&confirmation).await.unwrap();
        assert_eq!(decision, Decision::Declined);

        let prompts = transcript.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].starts_with("[confirmation 1/2]"));
        assert!(prompts[1].contains("Type 'destroy' to continue"));
    }

    #[tokio::test]
    async fn empty_resource_list_is_rejected() {
        let input = ScriptedInput::new(["yes"]);
        let transcript = input.transcript();
        let mut gate = ConfirmationGate::new(Box::new(input));

        let err = gate
            .confirm(&Confirmation::single(request("Apply plan", &[])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(transcript.prompts().is_empty());
    }

    #[tokio::test]
    async fn terminal_keeps_piped_answers_across_prompts() {
        let mut input = TerminalInput::new(BufReader::new(&b"yes\ndestroy\n"[..]), Vec::new());

        assert_eq!(input.respond("first? ", "yes").await.unwrap(), "yes\n");
        assert_eq!(input.respond("second? ", "destroy").await.unwrap(), "destroy\n");
        assert_eq!(input.respond("third? ", "yes").await.unwrap(), "");
        assert_eq!(input.writer, b"first? second? third? ".to_vec());
    }

    #[tokio::test]
    async fn piped_double_confirmation_approves() {
        let input = TerminalInput::new(BufReader::new(&b"yes\ndestroy\n"[..]), Vec::new());
        let mut gate = ConfirmationGate::new(Box::new(input));

        let decision = gate
            .confirm(&Confirmation::double(
                request("Destroy infrastructure", &["aws_vpc.main"]),
                request("Load balancers removed?", &["svc/ingress"]).with_token("destroy"),
            ))
            .await
            .unwrap();
        assert!(decision.is_approved());
    }

    #[tokio::test]
    async fn auto_approve_answers_with_token() {
        let mut gate = ConfirmationGate::interactive(true);
        let decision = gate
            .confirm(&Confirmation::double(
                request("Destroy", &["a"]),
                request("Checklist", &["b"]).with_token("destroy"),
            ))
            .await
            .unwrap();
        assert!(decision.is_approved());
    }
}
