use leadflow::{
    Action, ExecutionStatus, JobStatus, LlmAction, LlmReply, LlmResponseType, Role, SendError,
    TextContent,
};

mod common;
use common::{harness, seed_thread};

#[tokio::test]
async fn test_action_list_sends_in_order_and_commits_stage() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;

    let actions = vec![
        Action::SendAudio {
            asset_id: "pain_generic".to_string(),
        },
        Action::SendText {
            content: TextContent::Literal {
                literal: "Tell me what's holding you back".to_string(),
            },
        },
        Action::SetStage {
            stage_id: "warming".to_string(),
        },
    ];
    let report = h.processor.execute(&thread, &contact, &actions).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.sent, 2);
    assert_eq!(report.stage.as_deref(), Some("warming"));

    let sends = h.sender.sends();
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0].kind, "audio");
    assert_eq!(sends[0].payload, "https://media.test/audios/pain_generic.opus");
    assert_eq!(sends[1].kind, "text");

    let thread = h.store.thread(thread.id).await.unwrap();
    assert_eq!(thread.lead_stage.as_deref(), Some("warming"));

    // Audit trail: sentinel for the audio, literal for the text, and a
    // system message for the stage change.
    let messages = h.store.list_messages(thread.id, None).await;
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents[0], "[Audio sent: pain_generic]");
    assert_eq!(contents[1], "Tell me what's holding you back");
    assert!(contents[2].contains("cold -> warming"));
    assert_eq!(messages[2].role, Role::System);
}

#[tokio::test]
async fn test_transient_failure_retries_once_then_succeeds() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;
    h.sender
        .push_failure(SendError::Transient("503 from provider".to_string()));

    let actions = vec![Action::SendText {
        content: TextContent::Literal {
            literal: "hello".to_string(),
        },
    }];
    let report = h.processor.execute(&thread, &contact, &actions).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(h.sender.sends().len(), 1);
}

#[tokio::test]
async fn test_second_transient_failure_aborts_without_stage() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;
    h.sender
        .push_failure(SendError::Transient("503".to_string()));
    h.sender
        .push_failure(SendError::Transient("503 again".to_string()));

    let actions = vec![
        Action::SendText {
            content: TextContent::Literal {
                literal: "hello".to_string(),
            },
        },
        Action::SendAudio {
            asset_id: "welcome".to_string(),
        },
        Action::SetStage {
            stage_id: "warming".to_string(),
        },
    ];
    let report = h.processor.execute(&thread, &contact, &actions).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Aborted);
    assert_eq!(report.sent, 0);
    // Remaining actions were skipped.
    assert!(h.sender.sends().is_empty());

    let thread = h.store.thread(thread.id).await.unwrap();
    assert_eq!(thread.lead_stage.as_deref(), Some("cold"));
    let messages = h.store.list_messages(thread.id, None).await;
    let last = messages.last().unwrap();
    assert_eq!(last.role, Role::System);
    assert!(last.content.contains("aborted"));
}

#[tokio::test]
async fn test_permanent_failure_aborts_without_retry() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;
    h.sender
        .push_failure(SendError::Permanent("400 bad number".to_string()));

    let actions = vec![Action::SendText {
        content: TextContent::Literal {
            literal: "hello".to_string(),
        },
    }];
    let report = h.processor.execute(&thread, &contact, &actions).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Aborted);
    // No retry happened: the single scripted failure consumed the only
    // attempt.
    assert!(h.sender.sends().is_empty());
}

#[tokio::test]
async fn test_unknown_asset_aborts_like_a_permanent_failure() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;

    let actions = vec![
        Action::SendAudio {
            asset_id: "no_such_audio".to_string(),
        },
        Action::SetStage {
            stage_id: "warming".to_string(),
        },
    ];
    let report = h.processor.execute(&thread, &contact, &actions).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Aborted);
    assert!(h.sender.sends().is_empty());
    let thread = h.store.thread(thread.id).await.unwrap();
    assert_eq!(thread.lead_stage.as_deref(), Some("cold"));
}

#[tokio::test]
async fn test_schedule_and_cancel_commit_with_the_list() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "warm").await;

    let actions = vec![
        Action::Schedule {
            key: "cart_recovery_30m".to_string(),
            delay_secs: 1800,
            actions: vec![Action::SendAudio {
                asset_id: "recovery".to_string(),
            }],
        },
        Action::SetStage {
            stage_id: "hot".to_string(),
        },
    ];
    h.processor.execute(&thread, &contact, &actions).await.unwrap();
    assert!(h.store.has_pending_job(thread.id, "cart_recovery_").await);

    let thread = h.store.thread(thread.id).await.unwrap();
    let cancel = vec![Action::Cancel {
        key_prefix: "cart_recovery_".to_string(),
    }];
    h.processor.execute(&thread, &contact, &cancel).await.unwrap();
    assert!(!h.store.has_pending_job(thread.id, "cart_recovery_").await);
}

#[tokio::test]
async fn test_llm_text_reply_is_sent_verbatim() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;

    let reply = LlmReply::Text("We ship worldwide!".to_string());
    h.processor
        .execute_llm_reply(&thread, &contact, &reply)
        .await
        .unwrap();
    let sends = h.sender.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].payload, "We ship worldwide!");
}

#[tokio::test]
async fn test_llm_legal_stage_transition_commits() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;

    let reply = LlmReply::Action(LlmAction {
        response_type: LlmResponseType::Text,
        asset_id: None,
        template_code: None,
        message: Some("Got it, that sounds rough.".to_string()),
        next_stage: Some("warming".to_string()),
    });
    h.processor
        .execute_llm_reply(&thread, &contact, &reply)
        .await
        .unwrap();
    let thread = h.store.thread(thread.id).await.unwrap();
    assert_eq!(thread.lead_stage.as_deref(), Some("warming"));
}

#[tokio::test]
async fn test_llm_illegal_stage_transition_is_rejected() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;

    let reply = LlmReply::Action(LlmAction {
        response_type: LlmResponseType::Text,
        asset_id: None,
        template_code: None,
        message: Some("You should buy now!".to_string()),
        next_stage: Some("hot".to_string()),
    });
    h.processor
        .execute_llm_reply(&thread, &contact, &reply)
        .await
        .unwrap();

    // The message still went out, the stage did not move, and the
    // rejection is on the record.
    assert_eq!(h.sender.sends().len(), 1);
    let thread = h.store.thread(thread.id).await.unwrap();
    assert_eq!(thread.lead_stage.as_deref(), Some("cold"));
    let messages = h.store.list_messages(thread.id, None).await;
    assert!(messages
        .iter()
        .any(|m| m.role == Role::System && m.content.contains("rejected")));
}

#[tokio::test]
async fn test_llm_audio_action_resolves_aliases() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "cold").await;

    let reply = LlmReply::Action(LlmAction {
        response_type: LlmResponseType::Audio,
        asset_id: Some("audio3".to_string()),
        template_code: None,
        message: None,
        next_stage: None,
    });
    h.processor
        .execute_llm_reply(&thread, &contact, &reply)
        .await
        .unwrap();
    let sends = h.sender.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].payload, "https://media.test/audios/plans.opus");

    let messages = h.store.list_messages(thread.id, None).await;
    assert_eq!(messages.last().unwrap().content, "[Audio sent: plans]");
}

#[tokio::test]
async fn test_job_status_after_schedule_upsert() {
    let h = harness();
    let (contact, thread) = seed_thread(&h, "+15551112222", "warm").await;

    let schedule = |key: &str| {
        vec![Action::Schedule {
            key: key.to_string(),
            delay_secs: 60,
            actions: vec![],
        }]
    };
    h.processor
        .execute(&thread, &contact, &schedule("cart_recovery_30m"))
        .await
        .unwrap();
    let thread = h.store.thread(thread.id).await.unwrap();
    h.processor
        .execute(&thread, &contact, &schedule("cart_recovery_30m"))
        .await
        .unwrap();

    let jobs = h.store.jobs_for_thread(thread.id).await;
    let pending = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Pending)
        .count();
    assert_eq!(pending, 1);
}
