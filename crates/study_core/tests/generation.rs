//! End-to-end behaviour of the generation orchestrator and its charge saga.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use common::{valid_document_json, Harness};
use study_core::document::MIN_BLOCKS;
use study_core::domain::{ChargeState, GenerationStatus, LedgerOutcome};
use study_core::generation::GenerationConfig;
use study_core::memory::{ChargeFault, ScriptedModel};
use study_core::ports::{InlineImage, PortError};
use study_core::ServiceError;
use uuid::Uuid;

fn image() -> InlineImage {
    InlineImage {
        mime_type: "image/png".to_string(),
        data: Bytes::from_static(&[0x89, 0x50, 0x4e, 0x47]),
    }
}

#[tokio::test]
async fn successful_generation_charges_once_and_sets_pointer() {
    let h = Harness::builder().balance(3).build();

    let outcome = h.generation.generate(h.request("Cell biology exam next week")).await.unwrap();

    assert_eq!(outcome.credits_charged, 1);
    assert!(!outcome.already_charged);
    assert_eq!(outcome.document.title, "Cell biology exam prep");
    assert_eq!(h.ledger.balance_of(h.user_id), 2);
    assert_eq!(h.journal.state_of(h.user_id, outcome.generation_id), Some(ChargeState::Charged));

    let row = h.generations.get(h.user_id, outcome.generation_id).unwrap();
    assert_eq!(row.status, GenerationStatus::Done);
    assert_eq!(row.credits_charged, 1);
    assert_eq!(row.document, Some(outcome.document.clone()));

    let current = h.generation.current_generation(h.user_id).await.unwrap().unwrap();
    assert_eq!(current.id, outcome.generation_id);
}

#[tokio::test]
async fn replaying_a_generation_id_never_charges_twice() {
    let h = Harness::builder().balance(5).build();
    let id = Uuid::new_v4();
    let mut request = h.request("Organic chemistry");
    request.generation_id = Some(id);

    let first = h.generation.generate(request.clone()).await.unwrap();
    let second = h.generation.generate(request).await.unwrap();

    assert_eq!(first.generation_id, id);
    assert_eq!(second.generation_id, id);
    assert!(second.already_charged);
    assert_eq!(second.credits_charged, 1);
    assert_eq!(h.ledger.balance_of(h.user_id), 4);
    assert_eq!(h.ledger.charge_calls(), 1);
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.generations.get(h.user_id, id).unwrap().credits_charged, 1);
}

#[tokio::test]
async fn replay_after_lost_journal_commit_hits_the_keyed_ledger() {
    let h = Harness::builder().balance(5).build();
    let id = Uuid::new_v4();
    let mut request = h.request("Statistics");
    request.generation_id = Some(id);

    h.generation.generate(request.clone()).await.unwrap();
    // Pretend the process died before the journal recorded the commit.
    use study_core::ports::ChargeJournal;
    h.journal.transition(h.user_id, id, ChargeState::Intent).await.unwrap();

    let replay = h.generation.generate(request).await.unwrap();

    assert!(!replay.already_charged);
    assert_eq!(h.ledger.charge_calls(), 2);
    assert_eq!(h.ledger.applied_charges(), 1);
    assert_eq!(h.ledger.balance_of(h.user_id), 4);
}

#[tokio::test]
async fn charge_error_after_commit_is_refunded() {
    let h = Harness::builder().balance(4).build();
    h.ledger.set_charge_fault(ChargeFault::AfterApply);

    let err = h.generation.generate(h.request("Linear algebra")).await.unwrap_err();

    assert_matches!(err, ServiceError::ChargeFailed(_));
    assert_eq!(h.ledger.balance_of(h.user_id), 4);
    assert_eq!(h.ledger.applied_charges(), 1);
    assert!(h.generation.current_generation(h.user_id).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_charge_record_compensates_and_fails_the_row() {
    let h = Harness::builder().balance(2).build();
    h.generations.fail_record_charge(true);
    let id = Uuid::new_v4();
    let mut request = h.request("Thermodynamics");
    request.generation_id = Some(id);

    let err = h.generation.generate(request).await.unwrap_err();

    assert_eq!(err.code(), "CHARGE_FAILED");
    assert!(err.is_retriable());
    assert_eq!(h.ledger.balance_of(h.user_id), 2);
    assert_eq!(h.journal.state_of(h.user_id, id), Some(ChargeState::Refunded));
    let row = h.generations.get(h.user_id, id).unwrap();
    assert_eq!(row.status, GenerationStatus::Failed);
    assert_eq!(row.credits_charged, 0);
    assert_eq!(row.error_code.as_deref(), Some("CHARGE_FAILED"));
    assert!(row.document.is_none());

    let served = h.generation.get_generation(h.user_id, id).await.unwrap();
    assert!(served.document.is_none());
}

#[tokio::test]
async fn retry_after_compensated_charge_is_paid_exactly_once() {
    let h = Harness::builder().balance(5).build();
    h.ledger.set_charge_fault(ChargeFault::AfterApply);
    let id = Uuid::new_v4();
    let mut request = h.request("Organic chemistry");
    request.generation_id = Some(id);

    let err = h.generation.generate(request.clone()).await.unwrap_err();
    assert_eq!(err.code(), "CHARGE_FAILED");
    assert_eq!(h.ledger.balance_of(h.user_id), 5);
    assert_eq!(h.journal.state_of(h.user_id, id), Some(ChargeState::Refunded));

    h.ledger.set_charge_fault(ChargeFault::None);
    let retry = h.generation.generate(request).await.unwrap();

    assert!(!retry.already_charged);
    assert_eq!(retry.credits_charged, 1);
    assert_eq!(h.ledger.balance_of(h.user_id), 4);
    assert_eq!(h.ledger.applied_charges(), 2);
    assert_eq!(h.journal.state_of(h.user_id, id), Some(ChargeState::Charged));
    let row = h.generations.get(h.user_id, id).unwrap();
    assert_eq!(row.status, GenerationStatus::Done);
    assert_eq!(row.credits_charged, 1);
}

#[tokio::test]
async fn charge_rejected_before_commit_leaves_balance_untouched() {
    let h = Harness::builder().balance(2).build();
    h.ledger.set_charge_fault(ChargeFault::BeforeApply);
    let id = Uuid::new_v4();
    let mut request = h.request("Macroeconomics");
    request.generation_id = Some(id);

    let err = h.generation.generate(request).await.unwrap_err();

    assert_matches!(err, ServiceError::ChargeFailed(_));
    assert_eq!(h.ledger.balance_of(h.user_id), 2);
    assert_eq!(h.journal.state_of(h.user_id, id), Some(ChargeState::Refunded));
    let row = h.generation.get_generation(h.user_id, id).await.unwrap();
    assert_eq!(row.status, GenerationStatus::Failed);
    assert!(row.document.is_none());
}

#[tokio::test]
async fn refund_failure_is_journaled_for_reconciliation() {
    let h = Harness::builder().balance(3).build();
    h.ledger.set_charge_fault(ChargeFault::AfterApply);
    h.ledger.fail_refunds(true);
    let id = Uuid::new_v4();
    let mut request = h.request("Genetics");
    request.generation_id = Some(id);

    let err = h.generation.generate(request).await.unwrap_err();

    assert_matches!(err, ServiceError::ChargeFailed(_));
    assert_eq!(h.journal.state_of(h.user_id, id), Some(ChargeState::RefundFailed));
    assert_eq!(h.generations.get(h.user_id, id).unwrap().status, GenerationStatus::Failed);
}

#[tokio::test]
async fn zero_balance_is_rejected_without_a_row() {
    let h = Harness::builder().balance(0).build();
    let id = Uuid::new_v4();
    let mut request = h.request("History essay");
    request.generation_id = Some(id);

    let err = h.generation.generate(request).await.unwrap_err();

    assert_matches!(err, ServiceError::InsufficientCredits { balance: 0, cost: 1 });
    assert_eq!(err.code(), "INSUFFICIENT_CREDITS");
    assert!(h.generations.get(h.user_id, id).is_none());
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn balance_lost_between_check_and_charge_fails_the_row() {
    let h = Harness::builder().balance(1).build();
    h.ledger.set_charge_fault(ChargeFault::Insufficient);
    let id = Uuid::new_v4();
    let mut request = h.request("Physics");
    request.generation_id = Some(id);

    let err = h.generation.generate(request).await.unwrap_err();

    assert_matches!(err, ServiceError::InsufficientCredits { cost: 1, .. });
    let row = h.generations.get(h.user_id, id).unwrap();
    assert_eq!(row.status, GenerationStatus::Failed);
    assert_eq!(row.error_code.as_deref(), Some("INSUFFICIENT_CREDITS"));
    assert_eq!(h.ledger.balance_of(h.user_id), 1);
}

#[tokio::test]
async fn timeout_then_repair_success_charges_once() {
    let h = Harness::builder()
        .balance(2)
        .model(
            ScriptedModel::new(Err(PortError::Unexpected("unscripted".to_string())))
                .then(Err(PortError::Timeout(Duration::from_secs(60))))
                .then(Ok(valid_document_json())),
        )
        .build();

    let outcome = h.generation.generate(h.request("Calculus tomorrow")).await.unwrap();

    assert_eq!(h.model.calls(), 2);
    let requests = h.model.requests();
    assert_eq!(requests[1].temperature, 0.0);
    assert!(requests[1].system.contains("Return JSON only"));
    assert_eq!(outcome.credits_charged, 1);
    assert_eq!(h.ledger.applied_charges(), 1);
    assert_eq!(
        h.generations.get(h.user_id, outcome.generation_id).unwrap().status,
        GenerationStatus::Done
    );
}

#[tokio::test]
async fn slow_model_call_is_cut_off_by_the_timeout() {
    let h = Harness::builder()
        .model(
            ScriptedModel::new(Ok(valid_document_json()))
                .with_delay(Duration::from_millis(500)),
        )
        .generation(GenerationConfig::default().with_timeout(Duration::from_millis(50)))
        .build();

    let outcome = h.generation.generate(h.request("Chemistry")).await.unwrap();

    assert_eq!(h.model.calls(), 2);
    assert_eq!(outcome.credits_charged, 1);
}

#[tokio::test]
async fn invalid_output_twice_fails_without_charge() {
    let h = Harness::builder()
        .balance(2)
        .model(ScriptedModel::new(Ok("Sure! Here is your plan: ...".to_string())))
        .build();
    let id = Uuid::new_v4();
    let mut request = h.request("Biology");
    request.generation_id = Some(id);

    let err = h.generation.generate(request).await.unwrap_err();

    assert_matches!(err, ServiceError::InvalidStructuredOutput(_));
    assert!(err.is_retriable());
    assert_eq!(h.model.calls(), 2);
    assert_eq!(h.ledger.balance_of(h.user_id), 2);
    assert_eq!(h.ledger.charge_calls(), 0);
    let row = h.generations.get(h.user_id, id).unwrap();
    assert_eq!(row.status, GenerationStatus::Failed);
    assert_eq!(row.error_code.as_deref(), Some("OPENAI_INVALID_STRUCTURED_OUTPUT"));
}

#[tokio::test]
async fn wrong_shape_triggers_repair() {
    let h = Harness::builder()
        .model(
            ScriptedModel::new(Ok(valid_document_json()))
                .then(Ok(r#"{"title": "Only a title"}"#.to_string())),
        )
        .build();

    let outcome = h.generation.generate(h.request("Geography")).await.unwrap();

    assert_eq!(h.model.calls(), 2);
    assert!(outcome.document.blocks.len() >= MIN_BLOCKS);
}

#[tokio::test]
async fn missing_model_key_is_fatal_and_not_repaired() {
    let h = Harness::builder().model(ScriptedModel::unconfigured()).build();

    let err = h.generation.generate(h.request("Anything")).await.unwrap_err();

    assert_matches!(err, ServiceError::ModelKeyMissing);
    assert_eq!(err.code(), "OPENAI_KEY_MISSING");
    assert!(!err.is_retriable());
    assert_eq!(h.model.calls(), 1);
}

#[tokio::test]
async fn unreadable_ledger_is_a_server_misconfiguration() {
    let h = Harness::builder().build();
    h.ledger.fail_reads(true);
    let id = Uuid::new_v4();
    let mut request = h.request("Art history");
    request.generation_id = Some(id);

    let err = h.generation.generate(request).await.unwrap_err();

    assert_eq!(err.code(), "SERVER_MISCONFIGURED");
    assert!(h.generations.get(h.user_id, id).is_none());
    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn input_limits_are_checked_first() {
    let h = Harness::builder()
        .generation(GenerationConfig::default().with_limits(10, 2))
        .build();

    let err = h.generation.generate(h.request("a prompt that is too long")).await.unwrap_err();
    assert_matches!(err, ServiceError::PromptTooLong { max: 10, .. });

    let mut request = h.request("short");
    request.images = vec![image(), image(), image()];
    let err = h.generation.generate(request).await.unwrap_err();
    assert_matches!(err, ServiceError::TooManyFiles { count: 3, max: 2 });

    let err = h.generation.generate(h.request("   ")).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    let mut request = h.request("short");
    request.language = Some("fr".to_string());
    let err = h.generation.generate(request).await.unwrap_err();
    assert_matches!(err, ServiceError::InvalidInput(_));

    assert_eq!(h.model.calls(), 0);
}

#[tokio::test]
async fn images_raise_the_cost_and_reach_the_model() {
    let h = Harness::builder().balance(5).build();
    let mut request = h.request("Solve these worksheets");
    request.images = vec![image(), image(), image(), image()];

    let outcome = h.generation.generate(request).await.unwrap();

    assert_eq!(outcome.credits_charged, 3);
    assert_eq!(h.ledger.balance_of(h.user_id), 2);
    assert_eq!(h.model.requests()[0].images.len(), 4);
}

#[tokio::test]
async fn processed_plan_material_is_sent_to_the_model() {
    let h = Harness::builder().build();
    h.upload("notes.txt", "text/plain", b"Krebs cycle produces NADH").await;
    h.register_missing("gone.txt", "text/plain").await;
    h.ingestion.kick(h.user_id, h.plan_id).await.unwrap();

    let mut request = h.request("Metabolism");
    request.plan_id = Some(h.plan_id);
    h.generation.generate(request).await.unwrap();

    let sent = &h.model.requests()[0].user;
    assert!(sent.contains("Krebs cycle produces NADH"));
    assert!(sent.starts_with("Metabolism"));
}

#[tokio::test]
async fn pointer_failure_does_not_fail_the_generation() {
    let h = Harness::builder().build();
    h.pointer.fail_writes(true);

    let outcome = h.generation.generate(h.request("Poetry")).await.unwrap();

    assert_eq!(outcome.credits_charged, 1);
    assert!(h.generation.current_generation(h.user_id).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_regeneration_keeps_the_paid_document() {
    let h = Harness::builder()
        .model(
            ScriptedModel::new(Ok("not json".to_string()))
                .then(Ok(valid_document_json())),
        )
        .build();
    let id = Uuid::new_v4();
    let mut request = h.request("Anatomy");
    request.generation_id = Some(id);

    h.generation.generate(request.clone()).await.unwrap();
    let err = h.generation.generate(request).await.unwrap_err();

    assert_matches!(err, ServiceError::InvalidStructuredOutput(_));
    let row = h.generations.get(h.user_id, id).unwrap();
    assert_eq!(row.status, GenerationStatus::Done);
    assert_eq!(row.credits_charged, 1);
    assert!(row.document.is_some());
}

#[tokio::test]
async fn spanish_prompt_is_stored_with_its_language() {
    let h = Harness::builder().build();

    let outcome = h
        .generation
        .generate(h.request("Necesito preparar el examen de historia para la semana que viene"))
        .await
        .unwrap();

    let row = h.generations.get(h.user_id, outcome.generation_id).unwrap();
    assert_eq!(row.language, "es");
    assert!(h.model.requests()[0].user.contains("español"));
}

#[tokio::test]
async fn purchases_are_fulfilled_once_per_checkout() {
    let h = Harness::builder().balance(0).build();

    let first = h.generation.fulfill_purchase(h.user_id, 20, "cs_test_123").await.unwrap();
    let replay = h.generation.fulfill_purchase(h.user_id, 20, "cs_test_123").await.unwrap();

    assert_eq!(first, LedgerOutcome::Applied);
    assert_eq!(replay, LedgerOutcome::AlreadyApplied);
    assert_eq!(h.generation.balance(h.user_id).await.unwrap(), 20);
    assert_matches!(
        h.generation.fulfill_purchase(h.user_id, 0, "cs_test_456").await,
        Err(ServiceError::InvalidInput(_))
    );
}
