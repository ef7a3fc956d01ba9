use super::*;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn test_logger_creation() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("test.log");

    let logger = Logger::new(Some(&log_path), Some("DEBUG"));
    assert!(logger.is_ok());

    let logger = logger.unwrap();
    assert_eq!(logger.log_file(), &log_path);
    assert_eq!(logger.log_level(), "DEBUG");
}

#[test]
fn test_log_file_creation() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("logs").join("test.md");

    let _logger = Logger::new(Some(&log_path), None).unwrap();
    assert!(log_path.exists());

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("# Step Orchestration Log"));
    assert!(content.contains("Log started:"));
}

#[test]
fn test_step_transcript() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("test.md");
    let logger = Logger::new(Some(&log_path), None).unwrap();

    assert!(logger.log_step_started("s1", "u1", "c1", 0).is_ok());
    assert!(logger
        .log_tool_results(
            "s1",
            &json!([
                {"callId": "a", "name": "search", "status": "SUCCESS", "reused": true},
                {"callId": "b", "name": "fetch", "status": "ERROR"}
            ])
        )
        .is_ok());
    assert!(logger
        .log_client_calls("s1", &json!([{"id": "c", "name": "pick_point"}]))
        .is_ok());
    assert!(logger.log_assistant("s1", "All done").is_ok());
    assert!(logger.log_step_finished("s1", 2, "DONE").is_ok());

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("## Step Started"));
    assert!(content.contains("**Conversation:** c1"));
    assert!(content.contains("- `search` (a) **SUCCESS** reused"));
    assert!(content.contains("- `fetch` (b) **ERROR**\n"));
    assert!(content.contains("**Calls:** pick_point"));
    assert!(content.contains("All done"));
    assert!(content.contains("**Outcome:** DONE"));
}

#[test]
fn test_decision_detail_follows_level() {
    let temp_dir = tempdir().unwrap();
    let calls = json!([{"id": "a", "name": "search", "arguments": {"q": "x"}}]);

    let info_path = temp_dir.path().join("info.md");
    let logger = Logger::new(Some(&info_path), None).unwrap();
    logger.log_decision("s1", 0, &calls).unwrap();
    let content = std::fs::read_to_string(&info_path).unwrap();
    assert!(content.contains("**Tool Calls:** 1"));
    assert!(!content.contains("```json"));

    let debug_path = temp_dir.path().join("debug.md");
    let logger = Logger::new(Some(&debug_path), Some("debug")).unwrap();
    logger.log_decision("s1", 0, &calls).unwrap();
    let content = std::fs::read_to_string(&debug_path).unwrap();
    assert!(content.contains("```json"));
    assert!(content.contains("\"name\": \"search\""));
}

#[test]
fn test_blank_assistant_is_skipped() {
    let temp_dir = tempdir().unwrap();
    let log_path = temp_dir.path().join("test.md");
    let logger = Logger::new(Some(&log_path), None).unwrap();

    logger.log_assistant("s1", "   ").unwrap();
    logger.log_error("s1", "provider unreachable").unwrap();

    let content = std::fs::read_to_string(&log_path).unwrap();
    assert!(!content.contains("### Assistant"));
    assert!(content.contains("**Error:** provider unreachable"));
}
