//! Boundary transport: WebSocket chat channel plus the HTTP admin surface.
//!
//! Strictly a demultiplexer: it owns the session registry but holds no
//! board or message state of its own. Each session gets its own event bus,
//! gateway, memory, coordinator, orchestrator, and executor, built once on
//! first use inside the registry lock (which also closes the init race:
//! the executor's turn mutex exists before any turn can reach it).

mod frames;
mod http;
mod ws;

pub use frames::{ClientFrame, ServerFrame};
pub use http::router;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::board::LogBoardStorage;
use crate::config::RuntimeConfig;
use crate::events::EventBus;
use crate::executor::{MemorySearchTool, SessionExecutor, ToolRegistry, WebFetchTool};
use crate::gateway::{LanguageModel, ModelGateway};
use crate::memory::{MemoryManager, RecallIndex};
use crate::orchestrator::Orchestrator;
use crate::planner::Planner;
use crate::storage::{
    ArchiveLayer, ArchiveStore, DurableLog, DurableLogLayer, StorageCoordinator, StorageLayer,
};
use crate::utils::id_generator::IdGenerator;
use crate::worker::Worker;

/// Process-wide collaborators shared by every session, partitioned by
/// session id inside each store.
#[derive(Clone)]
pub struct SharedServices {
    pub config: RuntimeConfig,
    pub provider: Arc<dyn LanguageModel>,
    pub archive: Arc<dyn ArchiveStore>,
    pub log: Arc<dyn DurableLog>,
    pub index: Arc<dyn RecallIndex>,
}

/// Everything one session runs on.
pub struct SessionRuntime {
    pub session_id: String,
    pub bus: Arc<EventBus>,
    pub gateway: Arc<ModelGateway>,
    pub memory: Arc<MemoryManager>,
    pub coordinator: Arc<StorageCoordinator>,
    pub orchestrator: Arc<Orchestrator>,
    pub executor: Arc<SessionExecutor>,
}

/// Builds and caches per-session runtimes.
pub struct SessionRegistry {
    services: SharedServices,
    sessions: RwLock<FxHashMap<String, Arc<SessionRuntime>>>,
    ids: IdGenerator,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(services: SharedServices) -> Arc<Self> {
        Arc::new(Self {
            services,
            sessions: RwLock::new(FxHashMap::default()),
            ids: IdGenerator::new(),
        })
    }

    #[must_use]
    pub fn services(&self) -> &SharedServices {
        &self.services
    }

    #[must_use]
    pub fn mint_session_id(&self) -> String {
        self.ids.session_id()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionRuntime>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Fetch the session's runtime, building the full stack on first use.
    pub async fn get_or_create(&self, session_id: &str) -> Arc<SessionRuntime> {
        if let Some(runtime) = self.get(session_id).await {
            return runtime;
        }
        let mut sessions = self.sessions.write().await;
        if let Some(runtime) = sessions.get(session_id) {
            return Arc::clone(runtime);
        }
        let runtime = Arc::new(self.build_runtime(session_id));
        sessions.insert(session_id.to_string(), Arc::clone(&runtime));
        runtime
    }

    /// Drop the cached runtime (its stores keep their data).
    pub async fn remove(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
    }

    fn build_runtime(&self, session_id: &str) -> SessionRuntime {
        let config = &self.services.config;
        let bus = Arc::new(EventBus::stdout());

        let gateway = Arc::new(ModelGateway::new(
            Arc::clone(&self.services.provider),
            config.gateway.clone(),
            &config.provider.generation_model,
            &config.provider.embedding_model,
        ));
        let memory = MemoryManager::new(
            session_id,
            Arc::clone(&gateway),
            Arc::clone(&self.services.index),
            config.memory.clone(),
        );
        let coordinator = StorageCoordinator::new(
            vec![
                Arc::new(DurableLogLayer::new(Arc::clone(&self.services.log)))
                    as Arc<dyn StorageLayer>,
                Arc::new(ArchiveLayer::new(Arc::clone(&self.services.archive)))
                    as Arc<dyn StorageLayer>,
                Arc::clone(&memory) as Arc<dyn StorageLayer>,
            ],
            config.coordinator.clone(),
        );
        let planner = Arc::new(Planner::new(
            Arc::clone(&gateway),
            config.planner.clone(),
        ));
        let worker = Arc::new(Worker::new(Arc::clone(&gateway), config.worker.clone()));
        let board_storage = Arc::new(LogBoardStorage::new(Arc::clone(&self.services.log)));
        let orchestrator = Arc::new(Orchestrator::new(
            session_id,
            Arc::clone(&planner),
            worker,
            board_storage,
            bus.emitter(),
            config.auto_replan_on_failure,
        ));

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(MemorySearchTool::new(Arc::clone(&memory))));
        tools.register(Arc::new(WebFetchTool::new()));

        let executor = SessionExecutor::new(
            session_id,
            Arc::clone(&gateway),
            Arc::clone(&memory),
            Arc::clone(&coordinator),
            Arc::clone(&self.services.archive),
            Arc::clone(&orchestrator),
            planner,
            Arc::new(tools),
            bus.emitter(),
            config.executor.clone(),
        );

        SessionRuntime {
            session_id: session_id.to_string(),
            bus,
            gateway,
            memory,
            coordinator,
            orchestrator,
            executor,
        }
    }
}
