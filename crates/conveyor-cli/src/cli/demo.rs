//! Bundled demo workflows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use conveyor_core::workflow::control::CURRENT_ITEM_KEY;
use conveyor_core::workflow::decorator::TimingDecorator;
use conveyor_core::workflow::retry::{ExponentialBackoff, policy_from_config};
use conveyor_core::workflow::{
    CapturedFailure, FnStep, RunOptions, Step, StepCapabilities, StepOutput, Workflow,
    WorkflowBuilder, WorkflowContext,
};
use conveyor_observe::listener::TracingListener;
use conveyor_types::config::EngineConfig;
use conveyor_types::error::StepError;
use conveyor_types::workflow::ForkStrategy;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::DemoKind;
use super::report::{self, RunReport};

/// Build, run and print the selected demo.
pub async fn run(
    which: DemoKind,
    config: &EngineConfig,
    cancel: &CancellationToken,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let report = execute(which, config, cancel).await?;
    if !quiet {
        report::print(&report, json)?;
    }
    Ok(())
}

pub async fn execute(
    which: DemoKind,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let options = RunOptions::from_config(config)
        .with_listener(Arc::new(TracingListener))
        .with_decorator(TimingDecorator);

    let (mut workflow, mut ctx) = match which {
        DemoKind::Saga => saga(options)?,
        DemoKind::Fork => fork(options)?,
        DemoKind::Loop => line_items(options)?,
        DemoKind::Retry => retry(options, config)?,
    };

    let steps = workflow.len();
    let started = Instant::now();
    let outcome = workflow.run_in(&mut ctx, cancel).await;

    Ok(RunReport {
        workflow: workflow.name().to_string(),
        run_id: ctx.run_id(),
        state: workflow.state(),
        steps,
        elapsed: started.elapsed(),
        error: outcome.err().map(|e| e.to_string()),
        context: ctx.to_json(),
    })
}

// ---------------------------------------------------------------------------
// Saga
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    sku: String,
    quantity: u32,
    amount_cents: u64,
}

fn sample_order() -> Order {
    Order {
        id: "ord-1042".to_string(),
        sku: "KB-MX-RED".to_string(),
        quantity: 2,
        amount_cents: 25_800,
    }
}

/// Holds stock for the order; releases it on compensation.
#[derive(Default)]
struct ReserveInventory {
    reservation: Option<String>,
}

impl Step for ReserveInventory {
    fn capabilities(&self) -> StepCapabilities {
        StepCapabilities {
            compensable: true,
            ..StepCapabilities::default()
        }
    }

    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let order: Order = ctx.get("order")?;
        let reservation = format!("res-{}-{}", order.sku, order.quantity);
        ctx.set("reservation", &reservation)?;
        self.reservation = Some(reservation.clone());
        Ok(StepOutput::Value(json!({ "reservation": reservation })))
    }

    async fn compensate(
        &mut self,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        if let Some(reservation) = self.reservation.take() {
            tracing::info!(%reservation, "Releasing inventory");
            ctx.remove("reservation");
            ctx.set("inventory_released", true)?;
        }
        Ok(())
    }
}

/// Charges the amount bound from the context before the step runs.
#[derive(Default)]
struct ChargePayment {
    amount_cents: u64,
    charge_id: Option<String>,
}

impl Step for ChargePayment {
    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        let charge_id = format!("ch-{}", self.amount_cents);
        ctx.set("charge_id", &charge_id)?;
        self.charge_id = Some(charge_id);
        Ok(StepOutput::Value(json!({ "charged_cents": self.amount_cents })))
    }
}

fn saga(options: RunOptions) -> Result<(Workflow, WorkflowContext)> {
    let mut ctx = WorkflowContext::new();
    ctx.set("order", sample_order())?;

    let workflow = WorkflowBuilder::new("order-saga")
        .options(options)
        .then_fn("validate", |ctx| {
            let order: Order = ctx.get("order")?;
            if order.quantity == 0 {
                return Err(StepError::new("validation", "order has no items"));
            }
            Ok(StepOutput::Value(json!({ "order_id": order.id })))
        })
        .then(ReserveInventory::default())
        .then_with(ChargePayment::default(), |node| {
            node.before(|step, ctx| {
                let order: Order = ctx.get("order")?;
                step.amount_cents = order.amount_cents;
                Ok(())
            })
            .compensate_with(FnStep::new("refund", |ctx: &mut WorkflowContext| {
                let charge: String = ctx.get("charge_id")?;
                tracing::info!(%charge, "Refunding payment");
                ctx.set("refunded", charge)?;
                Ok(StepOutput::Empty)
            }));
        })
        .then_fn("ship", |_ctx| {
            Err(StepError::new("carrier", "no courier available for region"))
        })
        .finalizer(FnStep::new("notify", |ctx: &mut WorkflowContext| {
            ctx.set("customer_notified", true)?;
            Ok(StepOutput::Empty)
        }))
        .error_handler(FnStep::new("record-failure", |ctx: &mut WorkflowContext| {
            if let Some(failure) = ctx.singleton::<CapturedFailure>() {
                ctx.set("failure", failure.error.to_string())?;
            }
            Ok(StepOutput::Empty)
        }))
        .build()?;

    Ok((workflow, ctx))
}

// ---------------------------------------------------------------------------
// Fork
// ---------------------------------------------------------------------------

fn check(name: &'static str, latency: Duration) -> impl Fn(&mut WorkflowBuilder) + Send + Sync + 'static {
    move |b| {
        b.delay(latency).then_fn(name, move |ctx| {
            ctx.set("check", name)?;
            tracing::info!(check = name, "Check passed");
            Ok(StepOutput::Empty)
        });
    }
}

fn fork(options: RunOptions) -> Result<(Workflow, WorkflowContext)> {
    let mut ctx = WorkflowContext::new();
    ctx.set("order", sample_order())?;

    let workflow = WorkflowBuilder::new("order-checks")
        .options(options)
        .fork(ForkStrategy::WaitAll, |f| {
            f.branch(check("fraud", Duration::from_millis(40)))
                .branch(check("credit", Duration::from_millis(25)))
                .branch(check("address", Duration::from_millis(10)));
        })
        .fork(ForkStrategy::FireAndForget, |f| {
            f.branch(|b| {
                b.delay(Duration::from_millis(30)).then_fn("audit", |ctx| {
                    tracing::info!(run_id = ?ctx.run_id(), "Audit record written");
                    Ok(StepOutput::Empty)
                });
            });
        })
        .then_fn("approve", |ctx| {
            ctx.set("approved", true)?;
            Ok(StepOutput::Empty)
        })
        .build()?;

    Ok((workflow, ctx))
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LineItem {
    sku: String,
    quantity: u32,
    unit_cents: u64,
}

fn line_items(options: RunOptions) -> Result<(Workflow, WorkflowContext)> {
    let mut ctx = WorkflowContext::new();
    ctx.set(
        "items",
        vec![
            LineItem { sku: "KB-MX-RED".into(), quantity: 2, unit_cents: 12_900 },
            LineItem { sku: "CBL-USBC".into(), quantity: 3, unit_cents: 1_500 },
            LineItem { sku: "PAD-XL".into(), quantity: 1, unit_cents: 2_400 },
        ],
    )?;

    let workflow = WorkflowBuilder::new("order-subtotal")
        .options(options)
        .for_each_workflow(
            |ctx| Ok(ctx.get::<Vec<serde_json::Value>>("items")?),
            |b| {
                b.then_fn("price-line", |ctx| {
                    let item: LineItem = ctx.get(CURRENT_ITEM_KEY)?;
                    let subtotal = ctx.try_get::<u64>("subtotal").unwrap_or(0);
                    ctx.set("subtotal", subtotal + item.unit_cents * u64::from(item.quantity))?;
                    Ok(StepOutput::Empty)
                });
            },
        )
        .then_fn("tax", |ctx| {
            let subtotal: u64 = ctx.get("subtotal")?;
            ctx.set("tax", subtotal * 8 / 100)?;
            Ok(StepOutput::Value(json!({ "total": subtotal + subtotal * 8 / 100 })))
        })
        .build()?;

    Ok((workflow, ctx))
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Fails `failures` times with a retryable error, then succeeds.
struct FlakyGateway {
    failures: u32,
    attempts: u32,
}

impl Step for FlakyGateway {
    async fn execute(
        &mut self,
        ctx: &mut WorkflowContext,
        _cancel: &CancellationToken,
    ) -> Result<StepOutput, StepError> {
        self.attempts += 1;
        ctx.set("gateway_attempts", self.attempts)?;
        if self.attempts <= self.failures {
            return Err(StepError::new("unavailable", "gateway returned 503"));
        }
        Ok(StepOutput::Value(json!({ "status": "accepted" })))
    }
}

fn retry(options: RunOptions, config: &EngineConfig) -> Result<(Workflow, WorkflowContext)> {
    // Config-driven policy when one is configured, otherwise a demo backoff.
    let policy = policy_from_config(&config.retry).unwrap_or_else(|| {
        Arc::new(
            ExponentialBackoff::new(4, Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(400)),
        )
    });

    let workflow = WorkflowBuilder::new("payment-gateway")
        .options(options)
        .then_with(FlakyGateway { failures: 2, attempts: 0 }, move |node| {
            node.retry_shared(policy);
        })
        .build()?;

    Ok((workflow, WorkflowContext::new()))
}
