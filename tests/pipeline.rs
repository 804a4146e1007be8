//! End-to-end pipeline tests modeled on a checkout request handler:
//! a request span with validation and charge children, an order counter,
//! and logs correlated to the active span.

use std::collections::HashSet;
use std::thread;
use tracepipe::logs::{CorrelationLayer, InMemoryLogSink};
use tracepipe::metrics::Temporality;
use tracepipe::trace::{InMemorySpanExporter, IncrementIdGenerator, SpanData, Status};
use tracepipe::{Context, KeyValue, Pipeline, TelemetryError};
use tracing_subscriber::prelude::*;

fn find<'a>(spans: &'a [SpanData], name: &str) -> &'a SpanData {
    spans
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("span {name:?} not exported"))
}

/// One simulated checkout request against the given pipeline.
fn handle_checkout(pipeline: &Pipeline, payment_method: &'static str, card_ok: bool) {
    let tracer = pipeline.tracer();
    let orders = pipeline.meter().create_counter("checkout.orders").unwrap();

    tracer.in_span("POST /checkout", |cx| {
        cx.span()
            .set_attribute(KeyValue::new("payment.method", payment_method))
            .unwrap();

        tracer.in_span("validate_cart", |_cx| {
            tracing::info!(items = 3, "cart validated");
        });

        let charged = tracer.in_span("charge_card", |charge_cx| {
            if card_ok {
                tracing::info!(payment.method = payment_method, "payment accepted");
                true
            } else {
                tracing::warn!(payment.method = payment_method, "payment declined");
                charge_cx
                    .span()
                    .set_status(Status::error("payment declined"))
                    .unwrap();
                false
            }
        });

        if charged {
            orders
                .add(1.0, &[KeyValue::new("payment.method", payment_method)])
                .unwrap();
        } else {
            cx.span()
                .set_status(Status::error("payment declined"))
                .unwrap();
        }
    });
}

#[test]
fn checkout_request_produces_a_coherent_trace() {
    let exporter = InMemorySpanExporter::default();
    let pipeline = Pipeline::builder()
        .with_service_name("checkout-service")
        .with_exporter(exporter.clone())
        .with_id_generator(IncrementIdGenerator::new())
        .build();

    handle_checkout(&pipeline, "card", true);
    pipeline.force_flush().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 3);

    let request = find(&spans, "POST /checkout");
    let validate = find(&spans, "validate_cart");
    let charge = find(&spans, "charge_card");

    assert!(request.is_root());
    assert_eq!(validate.parent_span_id, request.span_context.span_id());
    assert_eq!(charge.parent_span_id, request.span_context.span_id());
    for span in &spans {
        assert_eq!(
            span.span_context.trace_id(),
            request.span_context.trace_id()
        );
        assert!(span.end_time >= span.start_time);
        assert_eq!(span.status, Status::Ok);
    }
    assert_eq!(
        request.attributes,
        vec![KeyValue::new("payment.method", "card")]
    );
}

#[test]
fn declined_payment_marks_spans_as_errors() {
    let exporter = InMemorySpanExporter::default();
    let pipeline = Pipeline::builder().with_exporter(exporter.clone()).build();

    handle_checkout(&pipeline, "card", false);
    pipeline.force_flush().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(
        find(&spans, "charge_card").status,
        Status::error("payment declined")
    );
    assert_eq!(
        find(&spans, "POST /checkout").status,
        Status::error("payment declined")
    );
    assert_eq!(find(&spans, "validate_cart").status, Status::Ok);

    let orders = pipeline
        .meter()
        .collect()
        .unwrap()
        .into_iter()
        .find(|s| s.name == "checkout.orders");
    assert!(orders.is_none() || orders.unwrap().data_points.is_empty());
}

#[test]
fn counters_aggregate_across_requests() {
    let exporter = InMemorySpanExporter::default();
    let pipeline = Pipeline::builder()
        .with_exporter(exporter.clone())
        .with_temporality(Temporality::Delta)
        .build();

    handle_checkout(&pipeline, "card", true);
    handle_checkout(&pipeline, "card", true);
    handle_checkout(&pipeline, "cash", true);

    let snapshot = pipeline.meter().collect().unwrap();
    let orders = snapshot
        .iter()
        .find(|s| s.name == "checkout.orders")
        .unwrap();
    assert_eq!(
        orders.value(&[KeyValue::new("payment.method", "card")]),
        Some(2.0)
    );
    assert_eq!(
        orders.value(&[KeyValue::new("payment.method", "cash")]),
        Some(1.0)
    );

    // delta temporality: a second collection reports nothing new
    let snapshot = pipeline.meter().collect().unwrap();
    let orders = snapshot
        .iter()
        .find(|s| s.name == "checkout.orders")
        .unwrap();
    assert_eq!(
        orders.value(&[KeyValue::new("payment.method", "card")]),
        Some(0.0)
    );
}

#[test]
fn logs_are_correlated_with_the_emitting_span() {
    let exporter = InMemorySpanExporter::default();
    let sink = InMemoryLogSink::default();
    let pipeline = Pipeline::builder()
        .with_exporter(exporter.clone())
        .with_id_generator(IncrementIdGenerator::new())
        .build();
    let subscriber = tracing_subscriber::registry().with(CorrelationLayer::new(sink.clone()));

    tracing::subscriber::with_default(subscriber, || {
        handle_checkout(&pipeline, "card", true);
        tracing::info!("between requests");
        handle_checkout(&pipeline, "cash", true);
    });
    pipeline.force_flush().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    let records = sink.get_records();
    assert_eq!(records.len(), 5);

    // every in-span record points at a span that was actually exported
    let span_ids: HashSet<_> = spans.iter().map(|s| s.span_context.span_id()).collect();
    for record in records.iter().filter(|r| r.span_id.is_some()) {
        assert!(span_ids.contains(&record.span_id.unwrap()));
    }

    let uncorrelated = records.iter().find(|r| r.body == "between requests").unwrap();
    assert_eq!(uncorrelated.trace_id, None);

    // the two requests are distinct traces, and each record carries the
    // trace of its own request
    let validated: Vec<_> = records
        .iter()
        .filter(|r| r.body == "cart validated")
        .collect();
    assert_eq!(validated.len(), 2);
    assert_ne!(validated[0].trace_id, validated[1].trace_id);
}

#[test]
fn concurrent_requests_stay_isolated() {
    let exporter = InMemorySpanExporter::default();
    let pipeline = Pipeline::builder().with_exporter(exporter.clone()).build();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pipeline = pipeline.clone();
            thread::spawn(move || {
                assert!(!Context::current().has_active_span());
                handle_checkout(&pipeline, "card", true);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    pipeline.force_flush().unwrap();
    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 12);

    // four distinct traces, each with exactly three spans
    let traces: HashSet<_> = spans.iter().map(|s| s.span_context.trace_id()).collect();
    assert_eq!(traces.len(), 4);
    for trace_id in traces {
        assert_eq!(
            spans
                .iter()
                .filter(|s| s.span_context.trace_id() == trace_id)
                .count(),
            3
        );
    }
}

#[test]
fn shutdown_drains_and_rejects_further_work() {
    let exporter = InMemorySpanExporter::default();
    let pipeline = Pipeline::builder().with_exporter(exporter.clone()).build();
    let tracer = pipeline.tracer();

    for _ in 0..50 {
        tracer.start("buffered").end();
    }
    pipeline.shutdown().unwrap();

    assert_eq!(exporter.get_finished_spans().unwrap().len(), 50);
    assert_eq!(pipeline.stats().exported_spans(), 50);
    assert!(exporter.is_shutdown());

    let mut late = tracer.start("late");
    assert!(!late.is_recording());
    late.end();
    assert_eq!(exporter.get_finished_spans().unwrap().len(), 50);

    assert_eq!(pipeline.force_flush(), Err(TelemetryError::AlreadyShutdown));
    assert_eq!(pipeline.shutdown(), Err(TelemetryError::AlreadyShutdown));
}
