use crate::attachment::Attachment;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// 一条消息的附件集合，以内容路径为键
#[derive(Clone, Default)]
pub struct AttachmentSet {
    entries: BTreeMap<String, Arc<dyn Attachment>>,
}

impl AttachmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一键重复添加时后者覆盖前者
    pub fn with(mut self, key: impl Into<String>, attachment: Arc<dyn Attachment>) -> Self {
        self.insert(key, attachment);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, attachment: Arc<dyn Attachment>) {
        self.entries.insert(key.into(), attachment);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn Attachment>> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Attachment>)> {
        self.entries.iter().map(|(k, a)| (k.as_str(), a))
    }

    /// 按字节数升序排列（相同大小按键序），小附件（缩略图等）先到达接收方
    pub fn by_size_ascending(&self) -> Vec<(&str, &Arc<dyn Attachment>)> {
        let mut ordered: Vec<_> = self.iter().collect();
        ordered.sort_by_key(|(_, a)| a.size());
        ordered
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|a| a.size()).sum()
    }

    pub fn sent_bytes(&self) -> u64 {
        self.entries.values().map(|a| a.sent_bytes()).sum()
    }

    pub fn abort_all(&self) {
        for attachment in self.entries.values() {
            attachment.abort();
        }
    }

    pub fn dispose_all(&self) {
        for attachment in self.entries.values() {
            attachment.dispose();
        }
    }
}

impl fmt::Debug for AttachmentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, a)| (k, a.size())))
            .finish()
    }
}

impl FromIterator<(String, Arc<dyn Attachment>)> for AttachmentSet {
    fn from_iter<I: IntoIterator<Item = (String, Arc<dyn Attachment>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
