use async_trait::async_trait;

/// A single actionable control attached to an outbound message. The platform
/// echoes `tag` back in a callback event when the control is pressed.
#[derive(Debug, Clone)]
pub struct ControlSpec {
    pub label: String,
    pub tag: String,
}

/// Outbound side of a chat platform. Implementations chunk long text at the
/// platform limit before sending.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Per-message text limit used by the chunker.
    fn message_limit(&self) -> usize {
        4096
    }

    /// Send plain text. Returns the external id of the (first) sent message.
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> anyhow::Result<String>;

    /// Send text carrying one actionable control. Returns the external id of
    /// the message that carries the control.
    async fn send_message_with_control(
        &self,
        chat_id: &str,
        text: &str,
        control: &ControlSpec,
    ) -> anyhow::Result<String>;

    /// Mark a previously sent control message as resolved. Platforms without
    /// message editing may reply instead; the default is a no-op.
    async fn edit_or_annotate(
        &self,
        _chat_id: &str,
        _message_id: &str,
        _text: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
