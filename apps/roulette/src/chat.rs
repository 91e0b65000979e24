//! Per-session text channel. Nothing here outlives the session that owns it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatSender {
    Local,
    Partner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: u64,
    pub sender: ChatSender,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
    next_id: u64,
    unread: usize,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_local(&mut self, text: impl Into<String>) -> ChatMessage {
        self.push(ChatSender::Local, text.into())
    }

    /// Records a partner message. Counts as unread unless the chat view is open.
    pub fn push_partner(&mut self, text: impl Into<String>, view_open: bool) -> ChatMessage {
        if !view_open {
            self.unread += 1;
        }
        self.push(ChatSender::Partner, text.into())
    }

    fn push(&mut self, sender: ChatSender, text: String) -> ChatMessage {
        self.next_id += 1;
        let message = ChatMessage {
            id: self.next_id,
            sender,
            text,
        };
        self.messages.push(message.clone());
        message
    }

    pub fn mark_read(&mut self) {
        self.unread = 0;
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.unread = 0;
    }
}
