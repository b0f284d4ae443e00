mod common;

use chrono::{TimeZone, Utc};
use common::*;
use relationship_engine::api;
use relationship_engine::db;
use relationship_engine::job::{self, JobRequest};
use relationship_engine::model::TaskStatus;
use serde_json::json;

async fn status_of(h: &Harness, subject_id: &str) -> TaskStatus {
    let id: i64 = sqlx::query_scalar("SELECT id FROM tasks WHERE subject_id = ?")
        .bind(subject_id)
        .fetch_one(&h.pool)
        .await
        .unwrap();
    db::get_task(&h.pool, TENANT, id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn birthday_task_is_rendered_and_not_duplicated() {
    let h = harness().await;
    let mut maria = subject("stu-1", "Maria Silva");
    maria.birth_date = Some(date(1990, 3, 12));
    add_subject(&h.pool, maria).await;
    add_template(&h.pool, "BIRTHDAY_01", "birthday", "+0d", "Feliz aniversário, [PrimeiroNome]!", None).await;

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_created, 1);
    assert_eq!(run.strategies_failed, 0);
    assert!(run.errors.is_empty(), "{:?}", run.errors);
    assert_eq!(run.by_anchor["birthday"].students_found, 1);

    let task = db::get_task(&h.pool, TENANT, 1).await.unwrap().unwrap();
    assert_eq!(task.payload["message"], "Feliz aniversário, Maria!");
    assert_eq!(task.payload["student_name"], "Maria Silva");
    assert_eq!(task.variables_used, vec!["[PrimeiroNome]".to_string()]);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.anchor, "birthday");
    assert_eq!(task.created_by, "job");
    assert_eq!(task.scheduled_for, Utc.with_ymd_and_hms(2026, 3, 12, 9, 0, 0).unwrap());

    let action: String = sqlx::query_scalar("SELECT action FROM task_logs WHERE task_id = 1")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(action, "created");

    let again = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(again.tasks_created, 0);
    assert_eq!(again.tasks_updated, 1);
    assert_eq!(count_rows(&h.pool, "tasks").await, 1);
}

#[tokio::test]
async fn templates_are_read_once_per_ttl() {
    let h = harness().await;
    add_template(&h.pool, "BIRTHDAY_01", "birthday", "+0d", "Oi [Nome]", None).await;

    job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(h.source.reads(), 1);

    let forced = JobRequest {
        force_refresh: true,
        ..Default::default()
    };
    job::run(&h.engine, TENANT, &forced).await.unwrap();
    assert_eq!(h.source.reads(), 2);
}

#[tokio::test]
async fn per_subject_daily_cap_is_enforced() {
    let h = harness().await;
    let mut s = subject("stu-1", "Ana Costa");
    s.birth_date = Some(date(1985, 3, 10));
    add_subject(&h.pool, s).await;
    for code in ["B1", "B2", "B3", "B4"] {
        add_template(&h.pool, code, "birthday", "+0d", "Parabéns [PrimeiroNome]", None).await;
    }

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_created, 3);
    assert_eq!(run.tasks_skipped, 1);
    assert_eq!(count_rows(&h.pool, "tasks").await, 3);
}

#[tokio::test]
async fn audience_filter_excludes_tagged_subjects() {
    let h = harness().await;
    let mut vip = subject("stu-vip", "Bruno Reis");
    vip.tags = vec!["vip".into()];
    vip.birth_date = Some(date(1992, 3, 11));
    add_subject(&h.pool, vip).await;
    let mut regular = subject("stu-reg", "Carla Dias");
    regular.birth_date = Some(date(1993, 3, 11));
    add_subject(&h.pool, regular).await;
    add_template(
        &h.pool,
        "BIRTHDAY_01",
        "birthday",
        "+0d",
        "Oi [PrimeiroNome]",
        Some(json!({ "exclude_tags": ["vip"] })),
    )
    .await;

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_created, 1);
    let subject_id: String = sqlx::query_scalar("SELECT subject_id FROM tasks")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(subject_id, "stu-reg");
}

#[tokio::test]
async fn unsupported_anchor_does_not_stop_the_run() {
    let h = harness().await;
    let mut s = subject("stu-1", "Diego Alves");
    s.birth_date = Some(date(1990, 3, 10));
    add_subject(&h.pool, s).await;
    add_template(&h.pool, "BIRTHDAY_01", "birthday", "+0d", "Oi [PrimeiroNome]", None).await;
    add_template(&h.pool, "LEGACY", "legacy_anchor", "+0d", "Oi", None).await;

    let request = JobRequest {
        anchors: Some(vec!["birthday".into(), "bogus".into()]),
        ..Default::default()
    };
    let run = job::run(&h.engine, TENANT, &request).await.unwrap();
    assert_eq!(run.tasks_created, 1);
    assert_eq!(run.strategies_executed, 2);
    assert_eq!(run.strategies_failed, 1);
    assert!(run.errors.iter().any(|e| e.starts_with("bogus:")));
    assert!(run.errors.iter().any(|e| e.contains("LEGACY")));
}

#[tokio::test]
async fn invalid_templates_are_rejected_individually() {
    let h = harness().await;
    let mut s = subject("stu-1", "Elisa Moura");
    s.next_renewal_date = Some(date(2026, 3, 20));
    add_subject(&h.pool, s).await;
    add_template(&h.pool, "RENEW_NOFILTER", "renewal_window", "-3d", "Renove", None).await;
    add_template(&h.pool, "RENEW_BADOFFSET", "renewal_window", "3d", "Renove", Some(json!({}))).await;
    add_template(
        &h.pool,
        "RENEW_OK",
        "renewal_window",
        "-3d",
        "Seu plano vence em [DataVencimento]",
        Some(json!({ "status": ["active"] })),
    )
    .await;

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    let renewal = &run.by_anchor["renewal_window"];
    assert_eq!(renewal.templates_rejected, 2);
    assert_eq!(renewal.templates_processed, 1);
    assert_eq!(renewal.tasks_created, 1);

    let task = db::get_task(&h.pool, TENANT, 1).await.unwrap().unwrap();
    assert_eq!(task.payload["message"], "Seu plano vence em 20/03/2026");
    assert_eq!(task.scheduled_for, Utc.with_ymd_and_hms(2026, 3, 17, 9, 0, 0).unwrap());
}

#[tokio::test]
async fn past_dates_are_skipped() {
    let h = harness().await;
    let mut s = subject("stu-1", "Fabio Lins");
    s.first_workout_date = Some(date(2026, 3, 10));
    add_subject(&h.pool, s).await;
    add_template(&h.pool, "MSG2", "first_workout", "-1d", "Amanhã é o dia", None).await;
    add_template(&h.pool, "MSG3", "first_workout", "+0d", "Parabéns pelo treino", None).await;

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_created, 1);
    assert_eq!(run.tasks_skipped, 1);
    let code: String = sqlx::query_scalar("SELECT template_code FROM tasks")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(code, "MSG3");
}

#[tokio::test]
async fn occurrence_followup_carries_incident_details() {
    let h = harness().await;
    add_subject(&h.pool, subject("stu-1", "Gabi Nunes")).await;
    db::insert_occurrence(
        &h.pool,
        TENANT,
        "stu-1",
        "lesão",
        Some("dor no joelho"),
        Some(Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap()),
        Utc.with_ymd_and_hms(2026, 3, 3, 15, 0, 0).unwrap(),
    )
    .await
    .unwrap();
    add_template(
        &h.pool,
        "OCC",
        "occurrence_followup",
        "+0d",
        "Como está? ([TipoOcorrencia]: [DescricaoOcorrencia] em [DataOcorrencia])",
        None,
    )
    .await;

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_created, 1);
    let task = db::get_task(&h.pool, TENANT, 1).await.unwrap().unwrap();
    assert_eq!(task.payload["message"], "Como está? (lesão: dor no joelho em 03/03/2026)");
    assert_eq!(task.payload["occurrence"]["type"], "lesão");
}

#[tokio::test]
async fn dry_run_writes_no_tasks() {
    let h = harness().await;
    let mut s = subject("stu-1", "Hugo Pires");
    s.birth_date = Some(date(1990, 3, 10));
    add_subject(&h.pool, s).await;
    add_template(&h.pool, "BIRTHDAY_01", "birthday", "+0d", "Oi", None).await;

    let request = JobRequest {
        dry_run: true,
        ..Default::default()
    };
    let run = job::run(&h.engine, TENANT, &request).await.unwrap();
    assert!(run.dry_run);
    assert_eq!(run.tasks_created, 1);
    assert_eq!(count_rows(&h.pool, "tasks").await, 0);
    assert_eq!(count_rows(&h.pool, "task_logs").await, 0);
}

#[tokio::test]
async fn health_reports_last_run() {
    let h = harness().await;
    let before = job::health(&h.engine, TENANT).await.unwrap();
    assert!(before.last_run.is_none());
    assert_eq!(before.supported_anchors.len(), 8);

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    let after = job::health(&h.engine, TENANT).await.unwrap();
    assert_eq!(after.last_run.unwrap().run_id, run.run_id);
    assert_eq!(after.max_tasks_per_subject_per_day, 3);
}

#[tokio::test]
async fn trigger_requires_secret() {
    let h = harness().await;
    let secret = test_config().security.cron_secret;
    let err = api::trigger_job(&h.engine, &secret, Some("wrong"), TENANT, &JobRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 401);
    assert_eq!(count_rows(&h.pool, "run_stats").await, 0);

    api::trigger_job(&h.engine, &secret, Some(&secret), TENANT, &JobRequest::default())
        .await
        .unwrap();
    assert_eq!(count_rows(&h.pool, "run_stats").await, 1);
}

#[tokio::test]
async fn tasks_due_today_are_promoted_by_the_run_that_creates_them() {
    let h = harness().await;
    let mut today = subject("stu-1", "Iara Lopes");
    today.birth_date = Some(date(1991, 3, 10));
    add_subject(&h.pool, today).await;
    let mut tomorrow = subject("stu-2", "Jonas Prado");
    tomorrow.birth_date = Some(date(1991, 3, 11));
    add_subject(&h.pool, tomorrow).await;
    add_template(&h.pool, "BIRTHDAY_01", "birthday", "+0d", "Parabéns [PrimeiroNome]", None).await;

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_created, 2);
    assert_eq!(run.tasks_promoted, 1);
    assert_eq!(status_of(&h, "stu-1").await, TaskStatus::DueToday);
    assert_eq!(status_of(&h, "stu-2").await, TaskStatus::Pending);

    // No run on the 11th: the next one still picks the task up.
    let later = engine_at(&h.engine, Utc.with_ymd_and_hms(2026, 3, 12, 12, 0, 0).unwrap());
    let run = job::run(&later, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_promoted, 1);
    assert_eq!(status_of(&h, "stu-2").await, TaskStatus::DueToday);
}

#[tokio::test]
async fn each_occurrence_gets_its_own_followup() {
    let h = harness().await;
    add_subject(&h.pool, subject("stu-1", "Gabi Nunes")).await;
    let reminder = Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap();
    let absence = add_occurrence(&h.pool, "stu-1", "falta", "faltou 3 treinos", reminder).await;
    let injury = add_occurrence(&h.pool, "stu-1", "lesão", "dor no joelho", reminder).await;
    add_template(
        &h.pool,
        "OCC",
        "occurrence_followup",
        "+0d",
        "[TipoOcorrencia]: [DescricaoOcorrencia]",
        None,
    )
    .await;

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(run.tasks_created, 2);
    assert_eq!(run.tasks_updated, 0);

    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT occurrence_id, json_extract(payload, '$.message') FROM tasks ORDER BY occurrence_id",
    )
    .fetch_all(&h.pool)
    .await
    .unwrap();
    assert_eq!(
        rows,
        vec![
            (absence, "falta: faltou 3 treinos".to_string()),
            (injury, "lesão: dor no joelho".to_string()),
        ]
    );

    let again = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    assert_eq!(again.tasks_created, 0);
    assert_eq!(again.tasks_updated, 2);
    assert_eq!(count_rows(&h.pool, "tasks").await, 2);
}

#[tokio::test]
async fn malformed_and_inactive_templates_are_left_out() {
    let h = harness().await;
    let mut s = subject("stu-1", "Karina Melo");
    s.birth_date = Some(date(1990, 3, 11));
    add_subject(&h.pool, s).await;
    add_template(&h.pool, "B_GOOD", "birthday", "+0d", "Parabéns", None).await;
    add_template(&h.pool, "B_BROKEN", "birthday", "+0d", "Parabéns", None).await;
    add_template(&h.pool, "B_OFF", "birthday", "+0d", "Parabéns", None).await;
    db::set_template_audience_raw(&h.pool, TENANT, "B_BROKEN", Some("{not json"))
        .await
        .unwrap();
    db::set_template_active(&h.pool, TENANT, "B_OFF", false).await.unwrap();

    let run = job::run(&h.engine, TENANT, &JobRequest::default()).await.unwrap();
    let birthday = &run.by_anchor["birthday"];
    assert_eq!(birthday.templates_processed, 1);
    assert_eq!(birthday.templates_rejected, 1);
    assert_eq!(birthday.tasks_created, 1);
    assert_eq!(run.strategies_failed, 0);
    assert!(run.errors.iter().any(|e| e.contains("B_BROKEN")), "{:?}", run.errors);
    assert!(!run.errors.iter().any(|e| e.contains("B_OFF")));

    let codes: Vec<String> = sqlx::query_scalar("SELECT template_code FROM tasks")
        .fetch_all(&h.pool)
        .await
        .unwrap();
    assert_eq!(codes, vec!["B_GOOD".to_string()]);
}

#[tokio::test]
async fn failing_strategy_does_not_stop_its_batch_or_later_batches() {
    let mut cfg = test_config();
    cfg.engine.max_parallel_strategies = 2;
    let h = harness_with(cfg).await;
    let mut s = subject("stu-1", "Lucas Teles");
    s.birth_date = Some(date(1990, 3, 11));
    s.next_renewal_date = Some(date(2026, 3, 20));
    s.first_workout_date = Some(date(2026, 3, 12));
    add_subject(&h.pool, s).await;
    add_template(&h.pool, "BDAY", "birthday", "+0d", "Parabéns", None).await;
    add_template(&h.pool, "OCC", "occurrence_followup", "+0d", "Como está?", None).await;
    add_template(
        &h.pool,
        "RENEW",
        "renewal_window",
        "-3d",
        "Renove",
        Some(json!({ "status": ["active"] })),
    )
    .await;
    add_template(&h.pool, "FIRST", "first_workout", "+0d", "Bom treino", None).await;
    sqlx::query("DROP TABLE occurrences").execute(&h.pool).await.unwrap();

    // Batches: [birthday, occurrence_followup], [renewal_window, first_workout].
    let request = JobRequest {
        anchors: Some(vec![
            "birthday".into(),
            "occurrence_followup".into(),
            "renewal_window".into(),
            "first_workout".into(),
        ]),
        ..Default::default()
    };
    let run = job::run(&h.engine, TENANT, &request).await.unwrap();
    assert_eq!(run.strategies_executed, 4);
    assert_eq!(run.strategies_failed, 1);
    assert_eq!(run.tasks_created, 3);
    assert_eq!(run.by_anchor["birthday"].tasks_created, 1);
    assert_eq!(run.by_anchor["renewal_window"].tasks_created, 1);
    assert_eq!(run.by_anchor["first_workout"].tasks_created, 1);
    assert!(!run.by_anchor["occurrence_followup"].errors.is_empty());
    assert!(run.errors.iter().all(|e| e.starts_with("occurrence_followup:")), "{:?}", run.errors);
}
