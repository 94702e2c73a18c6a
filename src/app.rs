use std::sync::Arc;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::booking::{AppointmentConfirmer, BookingService};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::http::{self, AppState};
use crate::jobs::{Dispatcher, Jobs};
use crate::notify::Broadcaster;
use crate::slots::SlotRegistry;
use crate::store::{StoreError, Stores};
use crate::tasks::TaskQueue;

/// Every long-lived component, constructed once and shared by `Arc`.
pub struct App {
    pub config: Config,
    pub stores: Stores,
    pub slots: Arc<SlotRegistry>,
    pub events: Arc<Broadcaster>,
    pub queue: Arc<TaskQueue>,
    pub booking: Arc<BookingService>,
    pub catalog: Arc<Catalog>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl App {
    /// Open the collections under `config.data_dir` and wire the services.
    pub fn open(config: Config) -> Result<Self, StoreError> {
        let stores = Stores::open(&config.data_dir)?;
        Ok(Self::with_stores(config, stores))
    }

    pub fn with_stores(config: Config, stores: Stores) -> Self {
        let slots = Arc::new(SlotRegistry::new());
        let events = Arc::new(Broadcaster::new(config.subscriber_buffer));
        let queue = Arc::new(TaskQueue::new());

        let confirmer = Arc::new(AppointmentConfirmer::new(
            stores.clone(),
            slots.clone(),
            events.clone(),
        ));
        let jobs = Arc::new(Jobs::new(
            stores.clone(),
            events.clone(),
            config.reports_dir(),
            config.backups_dir(),
        ));
        let booking = Arc::new(BookingService::new(
            stores.clone(),
            slots.clone(),
            events.clone(),
            queue.clone(),
            config.strict_booking,
        ));
        let catalog = Arc::new(Catalog::new(
            stores.clone(),
            confirmer.clone(),
            slots.clone(),
            events.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(confirmer, jobs));

        Self {
            config,
            stores,
            slots,
            events,
            queue,
            booking,
            catalog,
            dispatcher,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the task worker and the slot reaper.
    pub fn start(&self) {
        self.queue.start(self.dispatcher.clone());
        tokio::spawn(crate::reaper::run_reaper(
            self.slots.clone(),
            self.config.slot_retention,
            self.config.reaper_interval,
            self.cancel.clone(),
        ));
    }

    pub fn state(&self) -> AppState {
        AppState {
            booking: self.booking.clone(),
            catalog: self.catalog.clone(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            reports_dir: self.config.reports_dir(),
            backups_dir: self.config.backups_dir(),
            shutdown: self.cancel.clone(),
        }
    }

    pub fn router(&self) -> Router {
        http::router(self.state())
    }

    /// Cancelled by `shutdown`; also ends open event streams.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the reaper and event streams, then let the worker drain what is already queued.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        info!("draining task queue...");
        self.queue.stop(self.config.shutdown_timeout).await;
    }
}
