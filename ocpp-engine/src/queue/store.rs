//! Durable queue store.
//!
//! Persists every undelivered outbound message (and the transaction state the
//! messages refer to) so the exact set of unconfirmed messages can be rebuilt
//! after a crash.
//!
//! Implements:
//! - Write-ahead log (one JSON record per line) for durability
//! - Crash recovery, dropping a torn trailing record
//! - Compaction by atomically rewriting the log with only live rows

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::queue::OutboundMessage;
use crate::transaction::EnhancedTransaction;

const WAL_FILE: &str = "queue.wal";
const WAL_TMP_FILE: &str = "queue.wal.tmp";

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Base directory for storage files
    pub dir: PathBuf,
    /// Sync to disk after every write
    pub fsync_on_write: bool,
    /// WAL size that triggers compaction (bytes)
    pub max_wal_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./ocpp-data"),
            fsync_on_write: true,
            max_wal_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

/// Persistence collaborator: a key-ordered table of outbound messages plus the
/// transactions they belong to.
pub trait QueueStore: Send {
    /// Persist a new message row. Fails if the unique id is already stored.
    fn insert(&mut self, message: &OutboundMessage) -> Result<(), StoreError>;

    /// Delete a message row; deleting an unknown id is a no-op.
    fn remove(&mut self, unique_id: &str) -> Result<(), StoreError>;

    /// Record a new transmission count for a stored message.
    fn update_attempts(&mut self, unique_id: &str, attempts: u32) -> Result<(), StoreError>;

    /// All stored messages in enqueue order.
    fn scan_all(&self) -> Result<Vec<OutboundMessage>, StoreError>;

    /// Insert or replace a transaction.
    fn save_transaction(&mut self, transaction: &EnhancedTransaction) -> Result<(), StoreError>;

    /// Persist the next free seq_no of a transaction.
    fn update_seq_no(&mut self, transaction_id: &str, seq_no: i32) -> Result<(), StoreError>;

    fn remove_transaction(&mut self, transaction_id: &str) -> Result<(), StoreError>;

    fn transactions(&self) -> Result<Vec<EnhancedTransaction>, StoreError>;
}

/// Store shared between the engine and the transaction subsystem
pub type SharedStore = Arc<Mutex<dyn QueueStore>>;

/// Wrap a store for sharing
pub fn shared<S: QueueStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// WAL record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WalEntry {
    #[serde(rename = "INSERT")]
    Insert(OutboundMessage),

    #[serde(rename = "ATTEMPTS")]
    Attempts { unique_id: String, attempts: u32 },

    #[serde(rename = "REMOVE")]
    Remove { unique_id: String },

    #[serde(rename = "TRANSACTION")]
    Transaction(EnhancedTransaction),

    #[serde(rename = "SEQ_NO")]
    SeqNo { transaction_id: String, seq_no: i32 },

    #[serde(rename = "TRANSACTION_REMOVED")]
    TransactionRemoved { transaction_id: String },
}

/// Live rows, rebuilt from the WAL
#[derive(Debug, Default)]
struct Tables {
    messages: BTreeMap<u64, OutboundMessage>,
    index: HashMap<String, u64>,
    transactions: BTreeMap<String, EnhancedTransaction>,
}

impl Tables {
    fn apply(&mut self, entry: WalEntry) {
        match entry {
            WalEntry::Insert(message) => {
                self.index.insert(message.unique_id.clone(), message.sequence);
                self.messages.insert(message.sequence, message);
            }
            WalEntry::Attempts {
                unique_id,
                attempts,
            } => {
                if let Some(seq) = self.index.get(&unique_id) {
                    if let Some(message) = self.messages.get_mut(seq) {
                        message.message_attempts = attempts;
                    }
                }
            }
            WalEntry::Remove { unique_id } => {
                if let Some(seq) = self.index.remove(&unique_id) {
                    self.messages.remove(&seq);
                }
            }
            WalEntry::Transaction(transaction) => {
                self.transactions
                    .insert(transaction.transaction_id.clone(), transaction);
            }
            WalEntry::SeqNo {
                transaction_id,
                seq_no,
            } => {
                if let Some(transaction) = self.transactions.get_mut(&transaction_id) {
                    transaction.seq_no = seq_no;
                }
            }
            WalEntry::TransactionRemoved { transaction_id } => {
                self.transactions.remove(&transaction_id);
            }
        }
    }

    /// Records that rebuild exactly the current tables
    fn live_entries(&self) -> Vec<WalEntry> {
        self.transactions
            .values()
            .cloned()
            .map(WalEntry::Transaction)
            .chain(self.messages.values().cloned().map(WalEntry::Insert))
            .collect()
    }
}

/// File-backed store
pub struct FileQueueStore {
    config: StorageConfig,
    /// Current WAL file
    wal_file: Option<BufWriter<File>>,
    /// Current WAL size
    wal_size: u64,
    tables: Tables,
}

impl FileQueueStore {
    /// Open the store in `config.dir`, replaying any existing WAL
    pub fn open(config: StorageConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.dir)?;

        let mut store = Self {
            config,
            wal_file: None,
            wal_size: 0,
            tables: Tables::default(),
        };
        store.recover()?;
        store.open_wal()?;
        Ok(store)
    }

    fn wal_path(&self) -> PathBuf {
        self.config.dir.join(WAL_FILE)
    }

    /// Open WAL file for appending
    fn open_wal(&mut self) -> Result<(), StoreError> {
        let wal_path = self.wal_path();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&wal_path)?;

        self.wal_size = file.metadata()?.len();
        self.wal_file = Some(BufWriter::new(file));

        debug!("Store: Opened WAL at {:?} (size={})", wal_path, self.wal_size);
        Ok(())
    }

    /// Replay the WAL into memory
    fn recover(&mut self) -> Result<(), StoreError> {
        let wal_path = self.wal_path();
        if !wal_path.exists() {
            return Ok(());
        }

        let mut data = fs::read(&wal_path)?;

        // A record is only visible once its terminating newline is on disk.
        let complete = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if complete < data.len() {
            warn!(
                "Store: Dropping torn WAL record ({} bytes)",
                data.len() - complete
            );
            data.truncate(complete);
            OpenOptions::new()
                .write(true)
                .open(&wal_path)?
                .set_len(complete as u64)?;
        }

        let mut line_num = 0;
        for line in data.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            line_num += 1;

            match serde_json::from_slice::<WalEntry>(line) {
                Ok(entry) => self.tables.apply(entry),
                Err(e) => {
                    warn!("Store: WAL parse error at record {}: {}", line_num, e);
                }
            }
        }

        info!(
            "Store: Replayed {} WAL records, {} messages and {} transactions recovered",
            line_num,
            self.tables.messages.len(),
            self.tables.transactions.len()
        );
        Ok(())
    }

    /// Write entry to WAL, then apply it
    fn write_wal(&mut self, entry: WalEntry) -> Result<(), StoreError> {
        let wal = self.wal_file.as_mut().ok_or(StoreError::NotOpen)?;

        let mut data = serde_json::to_vec(&entry)?;
        data.push(b'\n');
        wal.write_all(&data)?;
        wal.flush()?;

        if self.config.fsync_on_write {
            wal.get_ref().sync_data()?;
        }

        self.wal_size += data.len() as u64;
        self.tables.apply(entry);

        if self.wal_size >= self.config.max_wal_size {
            self.compact()?;
        }

        Ok(())
    }

    /// Rewrite the WAL with only the live rows (temp file + rename)
    fn compact(&mut self) -> Result<(), StoreError> {
        self.wal_file = None;

        let temp_path = self.config.dir.join(WAL_TMP_FILE);
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            for entry in self.tables.live_entries() {
                serde_json::to_writer(&mut writer, &entry)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, self.wal_path())?;

        self.open_wal()?;
        info!(
            "Store: WAL compacted to {} bytes ({} messages)",
            self.wal_size,
            self.tables.messages.len()
        );
        Ok(())
    }

    /// Current WAL size in bytes
    pub fn wal_size(&self) -> u64 {
        self.wal_size
    }
}

impl QueueStore for FileQueueStore {
    fn insert(&mut self, message: &OutboundMessage) -> Result<(), StoreError> {
        if self.tables.index.contains_key(&message.unique_id) {
            return Err(StoreError::DuplicateId(message.unique_id.clone()));
        }
        self.write_wal(WalEntry::Insert(message.clone()))?;
        debug!("Store: Saved message {}", message.unique_id);
        Ok(())
    }

    fn remove(&mut self, unique_id: &str) -> Result<(), StoreError> {
        if !self.tables.index.contains_key(unique_id) {
            return Ok(());
        }
        self.write_wal(WalEntry::Remove {
            unique_id: unique_id.to_string(),
        })?;
        debug!("Store: Removed message {}", unique_id);
        Ok(())
    }

    fn update_attempts(&mut self, unique_id: &str, attempts: u32) -> Result<(), StoreError> {
        if !self.tables.index.contains_key(unique_id) {
            return Ok(());
        }
        self.write_wal(WalEntry::Attempts {
            unique_id: unique_id.to_string(),
            attempts,
        })
    }

    fn scan_all(&self) -> Result<Vec<OutboundMessage>, StoreError> {
        Ok(self.tables.messages.values().cloned().collect())
    }

    fn save_transaction(&mut self, transaction: &EnhancedTransaction) -> Result<(), StoreError> {
        self.write_wal(WalEntry::Transaction(transaction.clone()))
    }

    fn update_seq_no(&mut self, transaction_id: &str, seq_no: i32) -> Result<(), StoreError> {
        self.write_wal(WalEntry::SeqNo {
            transaction_id: transaction_id.to_string(),
            seq_no,
        })
    }

    fn remove_transaction(&mut self, transaction_id: &str) -> Result<(), StoreError> {
        self.write_wal(WalEntry::TransactionRemoved {
            transaction_id: transaction_id.to_string(),
        })
    }

    fn transactions(&self) -> Result<Vec<EnhancedTransaction>, StoreError> {
        Ok(self.tables.transactions.values().cloned().collect())
    }
}

/// In-memory store for testing
#[derive(Default)]
pub struct MemoryQueueStore {
    tables: Tables,
    fail_writes: bool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating a broken disk
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn len(&self) -> usize {
        self.tables.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.messages.is_empty()
    }

    fn write(&mut self, entry: WalEntry) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        self.tables.apply(entry);
        Ok(())
    }
}

impl QueueStore for MemoryQueueStore {
    fn insert(&mut self, message: &OutboundMessage) -> Result<(), StoreError> {
        if self.tables.index.contains_key(&message.unique_id) {
            return Err(StoreError::DuplicateId(message.unique_id.clone()));
        }
        self.write(WalEntry::Insert(message.clone()))
    }

    fn remove(&mut self, unique_id: &str) -> Result<(), StoreError> {
        self.write(WalEntry::Remove {
            unique_id: unique_id.to_string(),
        })
    }

    fn update_attempts(&mut self, unique_id: &str, attempts: u32) -> Result<(), StoreError> {
        self.write(WalEntry::Attempts {
            unique_id: unique_id.to_string(),
            attempts,
        })
    }

    fn scan_all(&self) -> Result<Vec<OutboundMessage>, StoreError> {
        Ok(self.tables.messages.values().cloned().collect())
    }

    fn save_transaction(&mut self, transaction: &EnhancedTransaction) -> Result<(), StoreError> {
        self.write(WalEntry::Transaction(transaction.clone()))
    }

    fn update_seq_no(&mut self, transaction_id: &str, seq_no: i32) -> Result<(), StoreError> {
        self.write(WalEntry::SeqNo {
            transaction_id: transaction_id.to_string(),
            seq_no,
        })
    }

    fn remove_transaction(&mut self, transaction_id: &str) -> Result<(), StoreError> {
        self.write(WalEntry::TransactionRemoved {
            transaction_id: transaction_id.to_string(),
        })
    }

    fn transactions(&self) -> Result<Vec<EnhancedTransaction>, StoreError> {
        Ok(self.tables.transactions.values().cloned().collect())
    }
}
