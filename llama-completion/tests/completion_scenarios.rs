//! End-to-end completion runs over the recorded counting fixture.

use llama_completion::{
    CompletionContext, ContextConfig, PartialCompletion, SamplingParameters, ScriptedBackend,
    StopReason,
};
use llama_completion::types::TokenProbabilityView;
use rstest::rstest;

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/fixtures/counting.json");

fn counting_context() -> CompletionContext {
    let backend = ScriptedBackend::from_file(FIXTURE).unwrap();
    CompletionContext::new(Box::new(backend), ContextConfig::new(64)).unwrap()
}

fn complete(params: &SamplingParameters) -> (llama_completion::CompletionResult, Vec<String>) {
    let mut context = counting_context();
    let mut streamed = Vec::new();
    let result = context
        .complete("Count: 1", params, &mut |chunk: PartialCompletion| {
            streamed.push(chunk.token)
        })
        .unwrap();
    (result, streamed)
}

#[test]
fn test_stream_stops_at_blank_line() {
    let params = SamplingParameters::default().with_stop(["\n\n"]);
    let (result, streamed) = complete(&params);

    assert_eq!(streamed, vec![" 2", " 3", " 4", " 5"]);
    assert_eq!(result.text, " 2 3 4 5");
    assert_eq!(
        result.stop_reason,
        StopReason::Word {
            stopping_word: "\n\n".to_string()
        }
    );
    assert_eq!(result.tokens_evaluated, 4);
}

#[test]
fn test_stream_without_stops_runs_to_eos() {
    let (result, streamed) = complete(&SamplingParameters::default());

    assert_eq!(streamed.concat(), " 2 3 4 5\n\n done");
    assert_eq!(result.text, " 2 3 4 5\n\n done");
    assert!(result.stopped_eos());
    assert_eq!(result.tokens_predicted, 8);
}

#[rstest]
#[case(0, "")]
#[case(1, " 2")]
#[case(3, " 2 3 4")]
fn test_token_budget(#[case] n_predict: i32, #[case] expected: &str) {
    let params = SamplingParameters::default().with_n_predict(n_predict);
    let (result, streamed) = complete(&params);

    assert_eq!(result.text, expected);
    assert_eq!(streamed.concat(), expected);
    assert_eq!(result.tokens_predicted, n_predict as usize);
    assert_eq!(result.stop_reason, StopReason::Limit);
}

#[test]
fn test_streamed_text_matches_result_text() {
    let params = SamplingParameters::default().with_stop([" 4", "\n\n"]);
    let (result, streamed) = complete(&params);

    assert_eq!(streamed.concat(), result.text);
    assert_eq!(result.text, " 2 3");
    assert_eq!(result.stopping_word(), Some(" 4"));
}

#[test]
fn test_probabilities_include_recorded_candidates() {
    let params = SamplingParameters::default()
        .with_n_probs(3)
        .with_stop(["\n\n"]);
    let mut context = counting_context();
    let mut first_window: Option<Vec<TokenProbabilityView>> = None;
    let result = context
        .complete("Count: 1", &params, &mut |chunk: PartialCompletion| {
            if first_window.is_none() {
                first_window = chunk.completion_probabilities;
            }
        })
        .unwrap();

    let window = first_window.unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].content, " 2");
    let candidates: Vec<&str> = window[0].probs.iter().map(|c| c.tok_str.as_str()).collect();
    assert_eq!(candidates, vec![" 2", " 3", "\n"]);
    assert!((window[0].probs[0].prob - 0.82).abs() < 1e-6);

    // Every sampled token up to the stop keeps its record in the result
    assert_eq!(result.completion_probabilities.len(), 6);
}

#[test]
fn test_result_serializes_with_stop_reason() {
    let params = SamplingParameters::default().with_stop(["\n\n"]);
    let (result, _) = complete(&params);

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["text"], " 2 3 4 5");
    assert_eq!(json["stop_reason"]["type"], "word");
    assert_eq!(json["stop_reason"]["stopping_word"], "\n\n");
    assert!(json["timings"]["predicted_n"].is_number());
}

#[test]
fn test_follow_up_prompt_reuses_cache() {
    let mut context = counting_context();
    let params = SamplingParameters::default().with_stop(["\n\n"]);
    context
        .complete("Count: 1", &params, &mut |_chunk: PartialCompletion| {})
        .unwrap();
    let cached = context.n_past();

    let result = context
        .complete("Count: 1 2 3", &params, &mut |_chunk: PartialCompletion| {})
        .unwrap();

    assert!(cached >= 6);
    assert_eq!(result.tokens_evaluated, 6);
    // The second run picks the script up where the first run stopped
    assert_eq!(result.text, " done");
    assert!(result.stopped_eos());
}
