//! Execution store: executions, history, pending callbacks and definitions

use crate::models::definition::StateMachineDefinition;
use crate::models::execution::{
    CallbackStatus, Execution, ExecutionStatus, PendingCallback, TransitionRecord,
};
use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Durable home of everything the engine needs to resume after a restart
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution; fails if the id is taken
    fn create_execution(&self, execution: &Execution) -> Result<()>;

    /// Overwrite an existing execution
    fn save_execution(&self, execution: &Execution) -> Result<()>;

    /// Point-in-time snapshot of an execution
    fn get_execution(&self, id: Uuid) -> Result<Option<Execution>>;

    /// Executions ordered by start time, optionally filtered by status
    fn list_executions(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>>;

    /// Append a record, returning the sequence number assigned to it
    fn append_history(&self, record: TransitionRecord) -> Result<u64>;

    /// History of one execution in sequence order
    fn history(&self, execution_id: Uuid) -> Result<Vec<TransitionRecord>>;

    /// Save an execution together with the records describing how it got there
    fn commit(&self, execution: &Execution, records: Vec<TransitionRecord>) -> Result<()> {
        for record in records {
            self.append_history(record)?;
        }
        self.save_execution(execution)
    }

    fn put_callback(&self, callback: &PendingCallback) -> Result<()>;

    fn get_callback(&self, token: &str) -> Result<Option<PendingCallback>>;

    /// Callbacks still waiting for a resolution
    fn list_pending_callbacks(&self) -> Result<Vec<PendingCallback>>;

    fn put_definition(&self, definition: &StateMachineDefinition) -> Result<()>;

    fn get_definition(&self, name: &str) -> Result<Option<StateMachineDefinition>>;

    fn list_definitions(&self) -> Result<Vec<StateMachineDefinition>>;
}

/// Everything a store holds, in its serialized layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub definitions: BTreeMap<String, StateMachineDefinition>,
    #[serde(default)]
    pub executions: BTreeMap<Uuid, Execution>,
    #[serde(default)]
    pub history: BTreeMap<Uuid, Vec<TransitionRecord>>,
    #[serde(default)]
    pub callbacks: BTreeMap<String, PendingCallback>,
}

impl StoreData {
    fn append(&mut self, mut record: TransitionRecord) -> u64 {
        let records = self.history.entry(record.execution_id).or_default();
        let sequence = records.len() as u64 + 1;
        record.sequence = sequence;
        records.push(record);
        sequence
    }

    fn save_execution(&mut self, execution: &Execution) -> Result<()> {
        match self.executions.get_mut(&execution.id) {
            Some(slot) => {
                *slot = execution.clone();
                Ok(())
            }
            None => bail!("Execution {} does not exist", execution.id),
        }
    }
}

/// Volatile store for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_data(data: StoreData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.data
            .lock()
            .map_err(|_| anyhow!("Execution store lock poisoned"))
    }

    fn to_json(&self) -> Result<String> {
        let data = self.lock()?;
        serde_json::to_string_pretty(&*data).context("Failed to serialize execution store")
    }
}

impl ExecutionStore for MemoryStore {
    fn create_execution(&self, execution: &Execution) -> Result<()> {
        let mut data = self.lock()?;
        if data.executions.contains_key(&execution.id) {
            bail!("Execution {} already exists", execution.id);
        }
        data.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    fn save_execution(&self, execution: &Execution) -> Result<()> {
        self.lock()?.save_execution(execution)
    }

    fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        Ok(self.lock()?.executions.get(&id).cloned())
    }

    fn list_executions(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>> {
        let data = self.lock()?;
        let mut executions: Vec<Execution> = data
            .executions
            .values()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.started_at);
        Ok(executions)
    }

    fn append_history(&self, record: TransitionRecord) -> Result<u64> {
        Ok(self.lock()?.append(record))
    }

    fn history(&self, execution_id: Uuid) -> Result<Vec<TransitionRecord>> {
        Ok(self
            .lock()?
            .history
            .get(&execution_id)
            .cloned()
            .unwrap_or_default())
    }

    fn commit(&self, execution: &Execution, records: Vec<TransitionRecord>) -> Result<()> {
        let mut data = self.lock()?;
        data.save_execution(execution)?;
        for record in records {
            data.append(record);
        }
        Ok(())
    }

    fn put_callback(&self, callback: &PendingCallback) -> Result<()> {
        self.lock()?
            .callbacks
            .insert(callback.token.clone(), callback.clone());
        Ok(())
    }

    fn get_callback(&self, token: &str) -> Result<Option<PendingCallback>> {
        Ok(self.lock()?.callbacks.get(token).cloned())
    }

    fn list_pending_callbacks(&self) -> Result<Vec<PendingCallback>> {
        Ok(self
            .lock()?
            .callbacks
            .values()
            .filter(|c| c.status == CallbackStatus::Pending)
            .cloned()
            .collect())
    }

    fn put_definition(&self, definition: &StateMachineDefinition) -> Result<()> {
        self.lock()?
            .definitions
            .insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    fn get_definition(&self, name: &str) -> Result<Option<StateMachineDefinition>> {
        Ok(self.lock()?.definitions.get(name).cloned())
    }

    fn list_definitions(&self) -> Result<Vec<StateMachineDefinition>> {
        Ok(self.lock()?.definitions.values().cloned().collect())
    }
}

/// Store kept in memory and rewritten to a single JSON file on every mutation
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
    /// Serializes mutation plus file write so the file never lags a mutation
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open the store, loading existing content if the file exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let data = if path.exists() {
            Self::load(&path)?
        } else {
            StoreData::default()
        };

        Ok(Self {
            path,
            inner: MemoryStore::from_data(data),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<StoreData> {
        let file = File::open(path).context("Failed to open store file")?;
        file.lock_shared()
            .context("Failed to acquire read lock on store file")?;

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(file);
        reader
            .read_to_string(&mut contents)
            .context("Failed to read store file")?;
        drop(reader);

        if contents.trim().is_empty() {
            return Ok(StoreData::default());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse store file {}", path.display()))
    }

    fn save(&self) -> Result<()> {
        let json = self.inner.to_json()?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .context("Failed to open store file for writing")?;
        file.lock_exclusive()
            .context("Failed to acquire write lock on store file")?;

        let mut writer = std::io::BufWriter::new(file);
        writer
            .write_all(json.as_bytes())
            .context("Failed to write store file")?;
        writer.flush().context("Failed to flush store file")?;
        Ok(())
    }

    fn mutate<R>(&self, op: impl FnOnce(&MemoryStore) -> Result<R>) -> Result<R> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow!("Store write lock poisoned"))?;
        let result = op(&self.inner)?;
        self.save()?;
        Ok(result)
    }
}

impl ExecutionStore for JsonFileStore {
    fn create_execution(&self, execution: &Execution) -> Result<()> {
        self.mutate(|store| store.create_execution(execution))
    }

    fn save_execution(&self, execution: &Execution) -> Result<()> {
        self.mutate(|store| store.save_execution(execution))
    }

    fn get_execution(&self, id: Uuid) -> Result<Option<Execution>> {
        self.inner.get_execution(id)
    }

    fn list_executions(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>> {
        self.inner.list_executions(status)
    }

    fn append_history(&self, record: TransitionRecord) -> Result<u64> {
        self.mutate(|store| store.append_history(record))
    }

    fn history(&self, execution_id: Uuid) -> Result<Vec<TransitionRecord>> {
        self.inner.history(execution_id)
    }

    fn commit(&self, execution: &Execution, records: Vec<TransitionRecord>) -> Result<()> {
        self.mutate(|store| store.commit(execution, records))
    }

    fn put_callback(&self, callback: &PendingCallback) -> Result<()> {
        self.mutate(|store| store.put_callback(callback))
    }

    fn get_callback(&self, token: &str) -> Result<Option<PendingCallback>> {
        self.inner.get_callback(token)
    }

    fn list_pending_callbacks(&self) -> Result<Vec<PendingCallback>> {
        self.inner.list_pending_callbacks()
    }

    fn put_definition(&self, definition: &StateMachineDefinition) -> Result<()> {
        self.mutate(|store| store.put_definition(definition))
    }

    fn get_definition(&self, name: &str) -> Result<Option<StateMachineDefinition>> {
        self.inner.get_definition(name)
    }

    fn list_definitions(&self) -> Result<Vec<StateMachineDefinition>> {
        self.inner.list_definitions()
    }
}
