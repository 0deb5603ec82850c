//! In-memory replicated log.
//!
//! Entries are 1-based and dense: the entry with index `i` lives at
//! `entries[i - 1]`. Index 0 is the implicit sentinel with term 0 that every
//! log shares, so `prev_log_index = 0` always matches.

use crate::error::StorageError;
use crate::message::LogEntry;
use crate::types::{Command, LogIndex, Term};


/// What a [`RaftLog::merge`] changed, enough to put the log back.
#[derive(Debug)]
pub struct MergeUndo {
    from: LogIndex,
    displaced: Vec<LogEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从持久化数据恢复日志，校验索引连续
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, StorageError> {
        for (pos, entry) in entries.iter().enumerate() {
            let expected = pos as u64 + 1;
            if entry.index != expected {
                return Err(StorageError::DataCorruption(expected));
            }
            if pos > 0 && entry.term < entries[pos - 1].term {
                return Err(StorageError::DataCorruption(entry.index));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// index 0 的 term 是 0；越界返回 None
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else {
            self.get(index).map(|e| e.term)
        }
    }

    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Entries in `[low, high]`, clamped to what the log holds.
    pub fn slice(&self, low: LogIndex, high: LogIndex) -> &[LogEntry] {
        let low = low.max(1);
        let high = high.min(self.last_index());
        if low > high {
            return &[];
        }
        &self.entries[(low - 1) as usize..high as usize]
    }

    pub fn entries_from(&self, index: LogIndex) -> Vec<LogEntry> {
        self.slice(index, self.last_index()).to_vec()
    }

    /// Leader 追加新命令，返回新条目的索引
    pub fn append(&mut self, term: Term, command: Command) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            term,
            index,
            command,
        });
        index
    }

    /// 删除 `index` 及之后的所有条目
    pub fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.saturating_sub(1) as usize;
        self.entries.truncate(keep);
    }

    /// First index holding the same term as the entry at `index`.
    pub fn first_index_of_term(&self, index: LogIndex) -> LogIndex {
        let Some(term) = self.get(index).map(|e| e.term) else {
            return index;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    pub fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        self.entries
            .iter()
            .rev()
            .skip_while(|e| e.term > term)
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// A candidate log ending at (`last_index`, `last_term`) is at least as
    /// up-to-date as this one.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        let self_last_term = self.last_term();
        last_term > self_last_term
            || (last_term == self_last_term && last_index >= self.last_index())
    }

    /// First index in `entries` (placed right after `prev_log_index`) whose
    /// term disagrees with an entry already in the log.
    pub fn find_conflict(&self, prev_log_index: LogIndex, entries: &[LogEntry]) -> Option<LogIndex> {
        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (prev_log_index + 1 + i as u64, entry.term))
            .find(|&(index, term)| matches!(self.term_at(index), Some(t) if t != term))
            .map(|(index, _)| index)
    }

    /// Follower 合并 Leader 发来的条目：截断冲突后缀，追加缺失部分，
    /// 已存在且 term 相同的条目保持不变。日志未变化时返回 None，
    /// 否则返回撤销记录，持久化失败时用它恢复原日志。
    pub fn merge(&mut self, prev_log_index: LogIndex, entries: Vec<LogEntry>) -> Option<MergeUndo> {
        let mut undo: Option<MergeUndo> = None;
        for (i, entry) in entries.into_iter().enumerate() {
            let index = prev_log_index + 1 + i as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    let displaced = self.entries.split_off((index - 1) as usize);
                    undo.get_or_insert(MergeUndo {
                        from: index,
                        displaced: Vec::new(),
                    })
                    .displaced
                    .extend(displaced);
                    self.entries.push(entry);
                }
                None => {
                    undo.get_or_insert(MergeUndo {
                        from: index,
                        displaced: Vec::new(),
                    });
                    self.entries.push(entry);
                }
            }
        }
        undo
    }

    /// 撤销一次 merge：删除它写入的条目，放回被截断的旧条目
    pub fn undo_merge(&mut self, undo: MergeUndo) {
        self.truncate_from(undo.from);
        self.entries.extend(undo.displaced);
    }
}
