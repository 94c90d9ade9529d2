//! In-memory document store.
//!
//! Serves a fixed script of results to every aggregation, recording each
//! pipeline it is sent. Scripts can also inject failing, stalling or
//! panicking cursor steps.

use super::{ConnectError, Connector, DocumentCursor, DocumentStore, StoreError};
use crate::settings::DataSourceSettings;
use async_trait::async_trait;
use bson::Document;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One scripted cursor step.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryItem {
    Doc(Document),
    /// The cursor advances but the document fails to decode.
    DecodeError(String),
    /// Advancing the cursor fails.
    FetchError(String),
    /// Advancing the cursor never completes.
    Stall,
    /// Decoding the document panics with this message.
    Panic(String),
    /// Advancing the cursor panics with this message.
    AdvancePanic(String),
}

/// Counters and recordings shared by a connector and everything it opens.
#[derive(Debug, Default)]
pub struct MemoryState {
    pipelines: Mutex<Vec<(String, String, Vec<Document>)>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl MemoryState {
    /// Every `(database, collection, pipeline)` aggregated so far.
    pub fn pipelines(&self) -> Vec<(String, String, Vec<Document>)> {
        self.pipelines.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    items: Vec<MemoryItem>,
    fail_connect: Option<String>,
    fail_aggregate: Option<String>,
    state: Arc<MemoryState>,
}

impl MemoryConnector {
    pub fn new(items: Vec<MemoryItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn from_docs(docs: impl IntoIterator<Item = Document>) -> Self {
        Self::new(docs.into_iter().map(MemoryItem::Doc).collect())
    }

    pub fn fail_connect(mut self, message: impl Into<String>) -> Self {
        self.fail_connect = Some(message.into());
        self
    }

    pub fn fail_aggregate(mut self, message: impl Into<String>) -> Self {
        self.fail_aggregate = Some(message.into());
        self
    }

    pub fn state(&self) -> Arc<MemoryState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        settings: &DataSourceSettings,
    ) -> Result<Box<dyn DocumentStore>, ConnectError> {
        settings.connection_uri()?;
        settings.tls_material()?;
        if let Some(message) = &self.fail_connect {
            return Err(ConnectError::User(message.clone()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryStore {
            items: self.items.clone(),
            fail_aggregate: self.fail_aggregate.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryStore {
    items: Vec<MemoryItem>,
    fail_aggregate: Option<String>,
    state: Arc<MemoryState>,
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn aggregate(
        &self,
        database: &str,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Box<dyn DocumentCursor>, StoreError> {
        self.state
            .pipelines
            .lock()
            .push((database.to_string(), collection.to_string(), pipeline));
        if let Some(message) = &self.fail_aggregate {
            return Err(StoreError::new(message.clone()));
        }
        Ok(Box::new(MemoryCursor {
            items: self.items.iter().cloned().collect(),
            current: None,
        }))
    }

    async fn close(self: Box<Self>) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryCursor {
    items: VecDeque<MemoryItem>,
    current: Option<MemoryItem>,
}

#[async_trait]
impl DocumentCursor for MemoryCursor {
    async fn advance(&mut self) -> Result<bool, StoreError> {
        self.current = None;
        match self.items.pop_front() {
            None => Ok(false),
            Some(MemoryItem::FetchError(message)) => Err(StoreError::new(message)),
            Some(MemoryItem::Stall) => std::future::pending().await,
            Some(MemoryItem::AdvancePanic(message)) => panic!("{}", message),
            Some(item) => {
                self.current = Some(item);
                Ok(true)
            }
        }
    }

    fn current(&self) -> Result<Document, StoreError> {
        match &self.current {
            Some(MemoryItem::Doc(doc)) => Ok(doc.clone()),
            Some(MemoryItem::DecodeError(message)) => Err(StoreError::new(message.clone())),
            Some(MemoryItem::Panic(message)) => panic!("{}", message),
            _ => Err(StoreError::new("cursor is not positioned on a document")),
        }
    }
}
