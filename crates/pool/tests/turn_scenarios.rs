//! Turn-engine scenarios: function-call rounds, grammar precedence, and
//! the pending-call round trip, all on the scripted mock backend.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{make_pool, model_config, write_weights, CountingHandler, SequenceHandler};
use lg_domain::chat::{ChatMessage, Role};
use lg_domain::function::FunctionDef;
use lg_domain::stream::FinishReason;
use lg_domain::Error;
use lg_pool::ChatRequest;
use lg_runtime::mock::{MockRuntime, RecordedConstraint, ScriptedGeneration};

fn chat(messages: Vec<ChatMessage>) -> ChatRequest {
    ChatRequest {
        messages,
        ..Default::default()
    }
}

#[tokio::test]
async fn single_evocable_function_resolves_within_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    runtime.push(ScriptedGeneration::calls(vec![("getUserLocation", json!({}))]));
    runtime.push(ScriptedGeneration::reply(
        "You are in New York, New York, United States.",
    ));

    let counter = Arc::new(AtomicUsize::new(0));
    let mut config = model_config(&file);
    config.functions.insert(
        "getUserLocation".into(),
        FunctionDef::new("Get the user's location", json!({ "type": "object" })).with_handler(
            Arc::new(CountingHandler {
                counter: counter.clone(),
                result: json!("New York, New York, United States"),
            }),
        ),
    );

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("Where am I?")]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.content.contains("New York"));
    assert!(result.function_calls.is_empty());
    assert_eq!(result.finish_reason, FinishReason::EogToken);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(result.usage.completion_tokens > 0);

    // Two generation rounds: the call round and the answer round.
    assert_eq!(runtime.generations().len(), 2);
}

#[tokio::test]
async fn non_evocable_call_round_trips_through_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    // Turn 1: resolve location host-side, then ask for the weather.
    runtime.push(ScriptedGeneration::calls(vec![("getUserLocation", json!({}))]));
    runtime.push(ScriptedGeneration::calls(vec![(
        "getLocationWeather",
        json!({ "location": "New York" }),
    )]));
    // Turn 2: answer from the supplied function result.
    runtime.push(ScriptedGeneration::reply(
        "It's Cloudy in New York today, around 21°.",
    ));

    let counter = Arc::new(AtomicUsize::new(0));
    let mut config = model_config(&file);
    config.functions.insert(
        "getUserLocation".into(),
        FunctionDef::new("Get the user's location", json!({ "type": "object" })).with_handler(
            Arc::new(CountingHandler {
                counter: counter.clone(),
                result: json!("New York"),
            }),
        ),
    );
    config.functions.insert(
        "getLocationWeather".into(),
        FunctionDef::new("Get the weather for a location", json!({ "type": "object" })),
    );

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let messages = vec![ChatMessage::user("What's the weather like today?")];

    let turn1 = pool
        .request_chat("m", chat(messages.clone()), None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(turn1.finish_reason, FinishReason::FunctionCall);
    assert!(turn1.content.is_empty());
    assert_eq!(turn1.function_calls.len(), 1);
    assert_eq!(turn1.function_calls[0].name, "getLocationWeather");

    let status = pool.status();
    assert_eq!(status.models["m"][0].pending_calls, 1);

    // Follow-up request supplies the matching function result.
    let call = &turn1.function_calls[0];
    let mut followup = messages;
    followup.push(ChatMessage {
        role: Role::Assistant,
        content: String::new(),
        call_id: None,
        name: None,
        function_calls: turn1.function_calls.clone(),
    });
    followup.push(ChatMessage::function_result(
        call.id.clone(),
        call.name.clone(),
        "New York today: Cloudy, 21°, low chance of rain.",
    ));

    let turn2 = pool
        .request_chat("m", chat(followup), None, CancellationToken::new())
        .await
        .unwrap();
    assert!(turn2.content.to_lowercase().contains("cloudy"));
    assert!(turn2.function_calls.is_empty());

    // The pending call was consumed.
    let status = pool.status();
    assert_eq!(status.models["m"][0].pending_calls, 0);

    // The splice put the resolved call into the history the model saw.
    let generations = runtime.generations();
    let final_round = generations.last().unwrap();
    let spliced = final_round.history.iter().any(|item| {
        matches!(
            item,
            lg_domain::chat::ChatHistoryItem::Model { response }
            if response.iter().any(|s| matches!(
                s,
                lg_domain::chat::ModelSegment::FunctionCall(seg)
                if seg.name == "getLocationWeather" && seg.result.is_some()
            ))
        )
    });
    assert!(spliced, "resolved call segment missing from history");
    // The follow-up reused the warm instance.
    assert!(final_round.had_cache_hint);
}

#[tokio::test]
async fn parallel_calls_run_in_one_request() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    runtime.push(ScriptedGeneration::calls(vec![
        ("getRandomNumber", json!({ "sides": 6 })),
        ("getRandomNumber", json!({ "sides": 6 })),
    ]));
    runtime.push(ScriptedGeneration::reply("You rolled 3 and 4."));

    let counter = Arc::new(AtomicUsize::new(0));
    let mut config = model_config(&file);
    config.functions.insert(
        "getRandomNumber".into(),
        FunctionDef::new("Roll a die", json!({ "type": "object" })).with_handler(Arc::new(
            SequenceHandler {
                counter: counter.clone(),
                values: vec![json!(3), json!(4)],
            },
        )),
    );

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user(
                "Roll the dice twice, then tell me the results.",
            )]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(result.content.contains('3'));
    assert!(result.content.contains('4'));
    assert!(result.function_calls.is_empty());
}

#[tokio::test]
async fn only_the_leading_evocable_prefix_executes() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    runtime.push(ScriptedGeneration::calls(vec![
        ("alpha", json!({ "n": 1 })),
        ("beta", json!({ "n": 2 })),
        ("gamma", json!({ "n": 3 })),
        ("alpha", json!({ "n": 4 })),
    ]));

    let alpha_count = Arc::new(AtomicUsize::new(0));
    let beta_count = Arc::new(AtomicUsize::new(0));
    let mut config = model_config(&file);
    config.functions.insert(
        "alpha".into(),
        FunctionDef::new("a", json!({})).with_handler(Arc::new(CountingHandler {
            counter: alpha_count.clone(),
            result: json!("a"),
        })),
    );
    config.functions.insert(
        "beta".into(),
        FunctionDef::new("b", json!({})).with_handler(Arc::new(CountingHandler {
            counter: beta_count.clone(),
            result: json!("b"),
        })),
    );
    config
        .functions
        .insert("gamma".into(), FunctionDef::new("g", json!({})));

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("go")]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Exactly the two leading evocables ran host-side.
    assert_eq!(alpha_count.load(Ordering::SeqCst), 1);
    assert_eq!(beta_count.load(Ordering::SeqCst), 1);

    // The non-evocable call and the trailing evocable were surfaced, in
    // emission order.
    assert_eq!(result.finish_reason, FinishReason::FunctionCall);
    assert!(result.content.is_empty());
    let surfaced: Vec<&str> = result
        .function_calls
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(surfaced, vec!["gamma", "alpha"]);
    assert_eq!(result.function_calls[1].parameters, json!({ "n": 4 }));

    // Generation stopped after one round.
    assert_eq!(runtime.generations().len(), 1);
}

#[tokio::test]
async fn grammar_constrains_output_and_wins_over_functions() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    runtime.push(ScriptedGeneration::reply(r#"{"answer": 42}"#));

    let mut config = model_config(&file);
    config
        .grammars
        .insert("json".into(), "root ::= object".into());
    config
        .functions
        .insert("ignored".into(), FunctionDef::new("f", json!({})));

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let result = pool
        .request_chat(
            "m",
            ChatRequest {
                messages: vec![ChatMessage::user("Answer as JSON.")],
                grammar: Some("json".into()),
                ..Default::default()
            },
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
    assert_eq!(parsed["answer"], 42);

    // Grammar silently wins: the runtime saw a grammar constraint, not a
    // function set.
    assert_eq!(
        runtime.generations()[0].constraint,
        RecordedConstraint::Grammar
    );
}

#[tokio::test]
async fn unknown_grammar_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    let mut config = model_config(&file);
    config
        .grammars
        .insert("json".into(), "root ::= object".into());

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let err = pool
        .request_chat(
            "m",
            ChatRequest {
                messages: vec![ChatMessage::user("hi")],
                grammar: Some("xyz".into()),
                ..Default::default()
            },
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownGrammar(name) if name == "xyz"));

    // Rejected at admission: no instance was ever spawned.
    assert!(runtime.loads().is_empty());
}

#[tokio::test]
async fn undefined_function_name_fails_the_request() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    runtime.push(ScriptedGeneration::calls(vec![("nosuch", json!({}))]));

    let mut config = model_config(&file);
    config
        .functions
        .insert("known".into(), FunctionDef::new("k", json!({})));

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let err = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("hi")]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UndefinedFunction(name) if name == "nosuch"));
}

/// A runtime failure mid-generation resolves the request with finish
/// reason `error` and the tokens already streamed; the instance stays in
/// the pool.
#[tokio::test]
async fn runtime_failure_surfaces_a_partial_result() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    runtime.push(
        ScriptedGeneration {
            text: vec!["partial ".into(), "output".into()],
            function_calls: vec![],
            stop_reason: lg_runtime::StopReason::EogToken,
            gate: None,
            fail: None,
        }
        .with_failure("kv cache slot corrupted"),
    );

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", model_config(&file))]);
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("go")]),
            Some(tx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Error);
    assert!(result.function_calls.is_empty());

    // The chunks streamed before the failure reached the caller.
    let mut streamed = String::new();
    while let Ok(chunk) = rx.try_recv() {
        streamed.push_str(&chunk.text);
    }
    assert_eq!(streamed, "partial output");

    // The instance was not evicted; the next request serves normally and
    // starts from the prior clean history (none here).
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("again")]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.content, "echo: again");
    assert_eq!(pool.status().models["m"].len(), 1);
}

/// Exhausting the function-call round limit resolves with finish reason
/// `error` instead of failing the request.
#[tokio::test]
async fn round_limit_surfaces_error_finish() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    // One evocable call per round, forever: the engine re-enters
    // generation after each resolution until it hits its round cap.
    for _ in 0..16 {
        runtime.push(ScriptedGeneration::calls(vec![("loop_fn", json!({}))]));
    }

    let counter = Arc::new(AtomicUsize::new(0));
    let mut config = model_config(&file);
    config.functions.insert(
        "loop_fn".into(),
        FunctionDef::new("loops", json!({})).with_handler(Arc::new(CountingHandler {
            counter: counter.clone(),
            result: json!("again"),
        })),
    );

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", config)]);
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("loop forever")]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Error);
    assert!(result.function_calls.is_empty());
    // Sixteen generation rounds ran, each resolving one call.
    assert_eq!(runtime.generations().len(), 16);
    assert_eq!(counter.load(Ordering::SeqCst), 16);

    // The instance survives and serves the next request.
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("fresh")]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.content, "echo: fresh");
}

#[tokio::test]
async fn unknown_model_is_rejected_before_queueing() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = MockRuntime::new();
    let pool = make_pool(&runtime, 1, dir.path(), vec![]);

    let err = pool
        .request_chat(
            "ghost",
            chat(vec![ChatMessage::user("hi")]),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownModel(name) if name == "ghost"));
}

#[tokio::test]
async fn streamed_chunks_arrive_in_emission_order() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_weights(dir.path(), "m.gguf");

    let runtime = MockRuntime::new();
    runtime.push(ScriptedGeneration {
        text: vec!["The ".into(), "quick ".into(), "fox.".into()],
        function_calls: vec![],
        stop_reason: lg_runtime::StopReason::EogToken,
        gate: None,
        fail: None,
    });

    let pool = make_pool(&runtime, 1, dir.path(), vec![("m", model_config(&file))]);
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let result = pool
        .request_chat(
            "m",
            chat(vec![ChatMessage::user("go")]),
            Some(tx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut streamed = String::new();
    while let Ok(chunk) = rx.try_recv() {
        streamed.push_str(&chunk.text);
    }
    assert_eq!(streamed, "The quick fox.");
    assert_eq!(result.content, "The quick fox.");
}
