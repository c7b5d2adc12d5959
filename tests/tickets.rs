use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use outpost::outbox::FetchPending;
use outpost::outbox::inmemory::InMemoryOutbox;
use outpost::transport::layers::{CorrelationLayer, CorrelationService};
use outpost::transport::{InMemoryBroker, PublisherService};
use outpost::{
    Context, Event, EventBus, EventHandler, EventProcessor, Outbox, Relay, Router, Supervisor,
    Transport,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .try_init();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TicketBookingConfirmed {
    booking_id: String,
    ticket_id: String,
    customer_email: String,
}

impl Event for TicketBookingConfirmed {
    const NAME: &'static str = "TicketBookingConfirmed";

    fn idempotency_key(&self) -> Option<&str> {
        Some(&self.booking_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TicketPrinted {
    ticket_id: String,
    file_name: String,
}

impl Event for TicketPrinted {
    const NAME: &'static str = "TicketPrinted";
}

#[derive(Debug, Clone)]
struct BookingRequest {
    booking_id: String,
    ticket_id: String,
    customer_email: String,
    card: &'static str,
}

impl BookingRequest {
    fn new(booking_id: &str) -> Self {
        Self {
            booking_id: booking_id.to_owned(),
            ticket_id: format!("ticket-{booking_id}"),
            customer_email: "ada@example.com".to_owned(),
            card: "4242",
        }
    }
}

#[derive(Debug, PartialEq)]
enum Booked {
    Created,
    AlreadyBooked,
}

/// Booking endpoint: the booking row and its event commit together.
#[derive(Clone)]
struct BookingService {
    store: InMemoryOutbox,
    bookings: Arc<Mutex<HashMap<String, String>>>,
    admission: Arc<tokio::sync::Mutex<()>>,
}

impl BookingService {
    fn new(store: InMemoryOutbox) -> Self {
        Self {
            store,
            bookings: Arc::default(),
            admission: Arc::default(),
        }
    }

    async fn book(
        &self,
        ctx: &Context,
        request: BookingRequest,
    ) -> Result<Booked, tower::BoxError> {
        // Row lock on the booking id.
        let _admission = self.admission.lock().await;
        if self.bookings.lock().unwrap().contains_key(&request.booking_id) {
            return Ok(Booked::AlreadyBooked);
        }

        let outbox = Outbox::new(self.store.clone());
        let mut tx = self.store.begin();

        let bookings = self.bookings.clone();
        let (booking_id, ticket_id) = (request.booking_id.clone(), request.ticket_id.clone());
        tx.on_commit(move || {
            bookings.lock().unwrap().insert(booking_id, ticket_id);
        });

        EventBus::new(outbox.writer(&mut tx))
            .publish(
                ctx,
                &TicketBookingConfirmed {
                    booking_id: request.booking_id,
                    ticket_id: request.ticket_id,
                    customer_email: request.customer_email,
                },
            )
            .await?;

        if request.card == "declined" {
            tx.rollback();
            return Err("payment declined".into());
        }

        tx.commit().await;
        Ok(Booked::Created)
    }
}

type DirectTransport = Transport<CorrelationService<PublisherService<InMemoryBroker>>>;

/// Issues one receipt per ticket and announces the printed ticket.
struct IssueReceipt {
    receipts: Arc<Mutex<HashSet<String>>>,
    transport: DirectTransport,
}

#[async_trait::async_trait]
impl EventHandler for IssueReceipt {
    type Event = TicketBookingConfirmed;

    fn name(&self) -> &str {
        "issue-receipt"
    }

    async fn handle(
        &self,
        ctx: &Context,
        event: TicketBookingConfirmed,
    ) -> Result<(), tower::BoxError> {
        if !self.receipts.lock().unwrap().insert(event.ticket_id.clone()) {
            tracing::info!(ticket_id = %event.ticket_id, "Receipt already issued");
            return Ok(());
        }

        EventBus::new(self.transport.clone())
            .publish(
                ctx,
                &TicketPrinted {
                    file_name: format!("{}.pdf", event.ticket_id),
                    ticket_id: event.ticket_id,
                },
            )
            .await?;
        Ok(())
    }
}

/// Records which correlation id each printed ticket carried.
#[derive(Clone, Default)]
struct PrintLog {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait::async_trait]
impl EventHandler for PrintLog {
    type Event = TicketPrinted;

    fn name(&self) -> &str {
        "print-log"
    }

    async fn handle(&self, ctx: &Context, event: TicketPrinted) -> Result<(), tower::BoxError> {
        self.seen
            .lock()
            .unwrap()
            .push((event.ticket_id, ctx.correlation_id().to_owned()));
        Ok(())
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn repeated_booking_creates_one_row_and_one_event() {
    init_tracing();
    let store = InMemoryOutbox::new();
    let service = BookingService::new(store.clone());
    let ctx = Context::with_correlation_id(CancellationToken::new(), "req-1");
    let request = BookingRequest::new("b-1");

    let (first, second, third) = tokio::join!(
        service.book(&ctx, request.clone()),
        service.book(&ctx, request.clone()),
        service.book(&ctx, request.clone()),
    );

    let mut outcomes = vec![first.unwrap(), second.unwrap(), third.unwrap()];
    outcomes.sort_by_key(|o| *o == Booked::AlreadyBooked);
    assert_eq!(
        outcomes,
        vec![Booked::Created, Booked::AlreadyBooked, Booked::AlreadyBooked]
    );
    assert_eq!(service.bookings.lock().unwrap().len(), 1);

    let pending = store.fetch_pending(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let metadata = pending[0].envelope().metadata();
    assert_eq!(metadata.idempotency_key(), Some("b-1"));
    assert_eq!(metadata.correlation_id(), Some("req-1"));
}

#[tokio::test]
async fn failed_booking_leaves_neither_row_nor_event() {
    init_tracing();
    let store = InMemoryOutbox::new();
    let service = BookingService::new(store.clone());
    let ctx = Context::new(CancellationToken::new());

    let request = BookingRequest {
        card: "declined",
        ..BookingRequest::new("b-2")
    };
    assert!(service.book(&ctx, request).await.is_err());

    assert!(service.bookings.lock().unwrap().is_empty());
    assert!(store.records().await.is_empty());
}

#[tokio::test]
async fn booking_flows_through_relay_and_router_keeping_correlation() {
    init_tracing();
    let store = InMemoryOutbox::new();
    let broker = InMemoryBroker::new();
    let service = BookingService::new(store.clone());

    let receipts = Arc::new(Mutex::new(HashSet::new()));
    let print_log = PrintLog::default();

    let mut router = Router::new(broker.clone(), Transport::new(broker.clone()))
        .with_default_middleware();
    EventProcessor::new(&mut router)
        .add_handler(IssueReceipt {
            receipts: receipts.clone(),
            transport: Transport::new(broker.clone()).layer(CorrelationLayer),
        })
        .unwrap()
        .add_handler(print_log.clone())
        .unwrap();

    let mut supervisor = Supervisor::default();
    let cancel = supervisor.cancellation_token();
    let router_ready = router.running();
    supervisor.spawn("router", router.run(cancel.clone()));
    supervisor.spawn(
        "relay",
        Relay::new(store.clone(), Transport::new(broker.clone()))
            .with_poll_interval(Duration::from_millis(10))
            .run(cancel.clone()),
    );
    router_ready.await;

    let ctx = Context::with_correlation_id(cancel.child_token(), "req-42");
    let request = BookingRequest::new("b-42");
    for _ in 0..3 {
        service.book(&ctx, request.clone()).await.unwrap();
    }

    let seen = print_log.seen.clone();
    eventually(|| !seen.lock().unwrap().is_empty()).await;
    eventually(|| receipt_settled(&broker)).await;

    assert_eq!(receipts.lock().unwrap().len(), 1);
    assert_eq!(
        *print_log.seen.lock().unwrap(),
        vec![("ticket-b-42".to_owned(), "req-42".to_owned())]
    );
    assert_eq!(broker.published_count(TicketBookingConfirmed::NAME), 1);

    cancel.cancel();
    supervisor.wait().await.unwrap();
    assert_eq!(store.pending_count().await, 0);
}

fn receipt_settled(broker: &InMemoryBroker) -> bool {
    let stats = broker.group_stats(TicketBookingConfirmed::NAME, "issue-receipt");
    stats.acked == 1 && stats.in_flight == 0
}
