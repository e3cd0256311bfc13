mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use rollcall_core::ImageInput;
use rollcall_engine::{AttendanceStatus, RecognitionError, RecognitionOutcome, RetryReason};
use tempfile::TempDir;

#[test]
fn test_enroll_then_check_in_twice_then_retry_cases() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    let recognition = engine.recognition();

    engine
        .enrollment()
        .enroll_named("S1", "Ada Lovelace", single(ADA))
        .unwrap();

    let first = recognition.recognize(single(ADA), day(9)).unwrap();
    let event = match first {
        RecognitionOutcome::Recognized {
            identity,
            display_name,
            confidence,
            attendance: AttendanceStatus::Recorded { event },
        } => {
            assert_eq!(identity, key("S1"));
            assert_eq!(display_name.as_deref(), Some("Ada Lovelace"));
            assert_eq!(confidence, 1.0);
            event
        }
        other => panic!("expected a recorded check-in, got {other:?}"),
    };
    assert_eq!(event.identity, "S1");
    assert_eq!(event.date, day(9));
    assert_eq!(event.confidence, 1.0);

    let second = recognition.recognize(single(ADA), day(9)).unwrap();
    assert!(matches!(
        second,
        RecognitionOutcome::Recognized {
            attendance: AttendanceStatus::AlreadyRecorded { .. },
            ..
        }
    ));

    let nobody = recognition.recognize(empty_room(), day(9)).unwrap();
    assert_eq!(
        nobody,
        RecognitionOutcome::TryAgain(RetryReason::NoFaceDetected)
    );

    let err = engine.enrollment().enroll("S2", two_people()).unwrap_err();
    assert!(matches!(
        err,
        rollcall_engine::EnrollmentError::MultipleFacesDetected { count: 2 }
    ));

    let register = recognition.attendance_on(day(9)).unwrap();
    assert_eq!(register.len(), 1);
    assert_eq!(register[0].id, event.id);
}

#[test]
fn test_next_day_records_again() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine.enrollment().enroll("S1", single(ADA)).unwrap();

    for d in [10, 11] {
        let outcome = engine.recognition().recognize(single(ADA), day(d)).unwrap();
        assert!(matches!(
            outcome,
            RecognitionOutcome::Recognized {
                attendance: AttendanceStatus::Recorded { .. },
                ..
            }
        ));
    }
    assert_eq!(engine.recognition().attendance_on(day(10)).unwrap().len(), 1);
    assert_eq!(engine.recognition().attendance_on(day(11)).unwrap().len(), 1);
}

#[test]
fn test_empty_gallery_is_distinct_from_no_match() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);

    let outcome = engine.recognition().recognize(single(ADA), day(1)).unwrap();
    assert_eq!(outcome, RecognitionOutcome::NoRegisteredIdentities);

    engine.enrollment().enroll("S2", single(GRACE)).unwrap();
    match engine.recognition().recognize(single(ADA), day(1)).unwrap() {
        RecognitionOutcome::NotRecognized { best_confidence } => {
            assert!(best_confidence < 0.6);
            assert!(best_confidence > 0.0);
        }
        other => panic!("expected no match, got {other:?}"),
    }
    assert!(engine.recognition().attendance_on(day(1)).unwrap().is_empty());
}

#[test]
fn test_undecodable_capture_asks_for_retry() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine.enrollment().enroll("S1", single(ADA)).unwrap();

    let outcome = engine
        .recognition()
        .recognize(ImageInput::DataUri("data:image/png;base64,@@@".into()), day(1))
        .unwrap();
    assert!(matches!(
        outcome,
        RecognitionOutcome::TryAgain(RetryReason::InvalidImage { .. })
    ));
    assert!(engine.recognition().attendance_on(day(1)).unwrap().is_empty());
}

#[test]
fn test_largest_face_is_the_one_recognized() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine.enrollment().enroll("ada", single(ADA)).unwrap();
    engine.enrollment().enroll("grace", single(GRACE)).unwrap();

    let crowd = ImageInput::bytes(portrait(&[
        face(5, 5, 40, GRACE),
        face(90, 90, 120, ADA),
    ]));
    let outcome = engine.recognition().recognize(crowd, day(2)).unwrap();
    assert!(matches!(
        outcome,
        RecognitionOutcome::Recognized { ref identity, .. } if identity.as_str() == "ada"
    ));
}

#[test]
fn test_concurrent_check_ins_record_one_event() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(engine(&tmp));
    engine.enrollment().enroll("S1", single(ADA)).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.recognition().recognize(single(ADA), day(12)).unwrap())
        })
        .collect();

    let mut recorded = 0;
    let mut already = 0;
    for worker in workers {
        match worker.join().unwrap() {
            RecognitionOutcome::Recognized { attendance, .. } => match attendance {
                AttendanceStatus::Recorded { .. } => recorded += 1,
                AttendanceStatus::AlreadyRecorded { .. } => already += 1,
            },
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!((recorded, already), (1, 7));
    assert_eq!(engine.recognition().attendance_on(day(12)).unwrap().len(), 1);
}

#[test]
fn test_failed_name_lookup_records_no_attendance() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine
        .enrollment()
        .enroll_named("S1", "Ada Lovelace", single(ADA))
        .unwrap();
    database(&tmp).execute_batch("DROP TABLE identities;").unwrap();

    let err = engine
        .recognition()
        .recognize(single(ADA), day(13))
        .unwrap_err();
    assert!(matches!(err, RecognitionError::StorageFailure(_)));
    assert!(engine.recognition().attendance_on(day(13)).unwrap().is_empty());
}

#[test]
fn test_outcomes_serialize_with_tags() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(&tmp);
    engine.enrollment().enroll("S1", single(ADA)).unwrap();

    let outcome = engine.recognition().recognize(single(ADA), day(3)).unwrap();
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["outcome"], "recognized");
    assert_eq!(json["identity"], "S1");
    assert_eq!(json["attendance"]["status"], "recorded");
    assert_eq!(json["attendance"]["event"]["date"], "2024-09-03");

    let retry = RecognitionOutcome::TryAgain(RetryReason::NoFaceDetected);
    let json = serde_json::to_value(&retry).unwrap();
    assert_eq!(json["outcome"], "try_again");
    assert_eq!(json["reason"], "no_face_detected");
}

#[tokio::test]
async fn test_engine_handle_runs_operations_off_the_runtime() {
    let tmp = TempDir::new().unwrap();
    let handle = engine(&tmp).into_handle();

    let record = handle
        .enroll("S1".into(), Some("Ada Lovelace".into()), single(ADA))
        .await
        .unwrap();
    assert_eq!(record.display_name.as_deref(), Some("Ada Lovelace"));

    let outcome = handle.recognize(single(ADA), day(6)).await.unwrap();
    assert!(matches!(outcome, RecognitionOutcome::Recognized { .. }));

    let status = handle.status().await.unwrap();
    assert_eq!(status.enrolled, 1);
    assert_eq!(status.confidence_threshold, 0.6);

    assert_eq!(handle.attendance_on(day(6)).await.unwrap().len(), 1);
    assert_eq!(handle.enrolled().await.unwrap(), vec![key("S1")]);

    let removed = handle.remove("S1".into()).await.unwrap();
    assert!(removed.existed());
    assert_eq!(handle.status().await.unwrap().enrolled, 0);
}
