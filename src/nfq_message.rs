use nfq::Message;

// nfq 的消息包一层，链表和 Stage 只认这个类型
pub struct NfqMessage(Message);

impl NfqMessage {
    pub fn len(&self) -> usize {
        self.0.get_payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AsRef<[u8]> for NfqMessage {
    fn as_ref(&self) -> &[u8] {
        self.0.get_payload()
    }
}

impl From<Message> for NfqMessage {
    fn from(value: Message) -> Self {
        Self(value)
    }
}

impl From<NfqMessage> for Message {
    fn from(value: NfqMessage) -> Self {
        value.0
    }
}
