//! In-memory [`Store`] implementation.
//!
//! Backs the scenario tests. State lives in `HashMap`s behind a
//! `std::sync::RwLock`; semantics match the PostgreSQL implementation,
//! including overwrite-on-conflict upserts and additive counter updates.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Account, Document, Integration, IntegrationConnection, Pipeline, PipelineRun,
    PipelineRunStep, RunError, StepStatus,
};

use super::Store;

/// `(account, pipeline, integration, document_type, id)` — the mirror key.
type DocumentKey = (String, String, Integration, String, String);

#[derive(Default)]
struct State {
    accounts: HashMap<String, Account>,
    pipelines: HashMap<String, Pipeline>,
    runs: HashMap<String, PipelineRun>,
    steps: HashMap<(String, String), PipelineRunStep>,
    connections: HashMap<(String, Integration), IntegrationConnection>,
    documents: HashMap<DocumentKey, Document>,
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for tests.

    pub fn insert_account(&self, account: Account) {
        self.state
            .write()
            .unwrap()
            .accounts
            .insert(account.id.clone(), account);
    }

    pub fn insert_pipeline(&self, pipeline: Pipeline) {
        self.state
            .write()
            .unwrap()
            .pipelines
            .insert(pipeline.id.clone(), pipeline);
    }

    pub fn insert_run(&self, run: PipelineRun) {
        self.state.write().unwrap().runs.insert(run.id.clone(), run);
    }

    pub fn insert_step(&self, step: PipelineRunStep) {
        self.state
            .write()
            .unwrap()
            .steps
            .insert((step.pipeline_run.clone(), step.data_source.clone()), step);
    }

    pub fn insert_connection(&self, connection: IntegrationConnection) {
        let account = match &connection {
            IntegrationConnection::Notion { account, .. }
            | IntegrationConnection::Linear { account, .. } => account.clone(),
        };
        self.state
            .write()
            .unwrap()
            .connections
            .insert((account, connection.integration()), connection);
    }

    pub fn insert_document(&self, document: Document) {
        let key = document_key(&document);
        self.state.write().unwrap().documents.insert(key, document);
    }

    // Inspection helpers for asserting on final state.

    pub fn account(&self, account_id: &str) -> Option<Account> {
        self.state.read().unwrap().accounts.get(account_id).cloned()
    }

    pub fn step(&self, run_id: &str, data_source_id: &str) -> Option<PipelineRunStep> {
        self.state
            .read()
            .unwrap()
            .steps
            .get(&(run_id.to_string(), data_source_id.to_string()))
            .cloned()
    }

    pub fn document_ids(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
    ) -> Vec<String> {
        let state = self.state.read().unwrap();
        let mut ids: Vec<String> = state
            .documents
            .values()
            .filter(|doc| {
                doc.account == account_id
                    && doc.pipeline == pipeline_id
                    && doc.integration == integration
            })
            .map(|doc| doc.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn document_count(&self) -> usize {
        self.state.read().unwrap().documents.len()
    }
}

fn document_key(document: &Document) -> DocumentKey {
    (
        document.account.clone(),
        document.pipeline.clone(),
        document.integration,
        document.document_type.clone(),
        document.id.clone(),
    )
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_account(&self, account_id: &str) -> Result<Option<Account>> {
        Ok(self.state.read().unwrap().accounts.get(account_id).cloned())
    }

    async fn get_pipeline(&self, pipeline_id: &str) -> Result<Option<Pipeline>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .pipelines
            .get(pipeline_id)
            .cloned())
    }

    async fn get_pipeline_run(&self, run_id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.state.read().unwrap().runs.get(run_id).cloned())
    }

    async fn get_pipeline_step(
        &self,
        run_id: &str,
        data_source_id: &str,
    ) -> Result<Option<PipelineRunStep>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .steps
            .get(&(run_id.to_string(), data_source_id.to_string()))
            .cloned())
    }

    async fn get_integration_connection(
        &self,
        account_id: &str,
        integration: Integration,
    ) -> Result<Option<IntegrationConnection>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .connections
            .get(&(account_id.to_string(), integration))
            .cloned())
    }

    async fn get_document(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        document_type: &str,
        document_id: &str,
    ) -> Result<Option<Document>> {
        let key = (
            account_id.to_string(),
            pipeline_id.to_string(),
            integration,
            document_type.to_string(),
            document_id.to_string(),
        );
        Ok(self.state.read().unwrap().documents.get(&key).cloned())
    }

    async fn get_missing_documents(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        found_ids: &[String],
    ) -> Result<Vec<Document>> {
        let state = self.state.read().unwrap();
        Ok(state
            .documents
            .values()
            .filter(|doc| {
                doc.account == account_id
                    && doc.pipeline == pipeline_id
                    && doc.integration == integration
                    && !found_ids.contains(&doc.id)
            })
            .cloned()
            .collect())
    }

    async fn update_pipeline_run_step(
        &self,
        run_id: &str,
        data_source_id: &str,
        status: StepStatus,
        error: Option<&RunError>,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(step) = state
            .steps
            .get_mut(&(run_id.to_string(), data_source_id.to_string()))
        {
            step.status = status;
            step.error = error.cloned();
            step.started_at = started_at;
            step.completed_at = completed_at;
        }
        Ok(())
    }

    async fn upsert_document(&self, document: &Document) -> Result<()> {
        let key = document_key(document);
        self.state
            .write()
            .unwrap()
            .documents
            .insert(key, document.clone());
        Ok(())
    }

    async fn delete_document(
        &self,
        account_id: &str,
        pipeline_id: &str,
        integration: Integration,
        document_type: &str,
        document_id: &str,
    ) -> Result<()> {
        let key = (
            account_id.to_string(),
            pipeline_id.to_string(),
            integration,
            document_type.to_string(),
            document_id.to_string(),
        );
        self.state.write().unwrap().documents.remove(&key);
        Ok(())
    }

    async fn suspend_account(&self, account_id: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(account) = state.accounts.get_mut(account_id) {
            account.is_suspended = true;
        }
        Ok(())
    }

    async fn increase_total_indexed_count(&self, account_id: &str, delta: i64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(account) = state.accounts.get_mut(account_id) {
            account.total_indexed_document_count += delta;
        }
        Ok(())
    }

    async fn increase_total_document_tokens(&self, account_id: &str, delta: i64) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(account) = state.accounts.get_mut(account_id) {
            account.total_indexed_document_tokens += delta;
        }
        Ok(())
    }
}
