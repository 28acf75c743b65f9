use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, ThrottleError};

/// 任务身份（由宿主队列在出队时提供，取出后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobIdentity {
    /// 任务类名
    pub class: String,
    /// 任务 ID（每次尝试唯一）
    pub id: String,
    /// 所在队列
    pub queue: String,
    /// 任务参数（对本层不透明）
    pub args: Vec<Value>,
}

/// 宿主队列中的原始负载，只解析本层关心的字段
#[derive(Debug, Deserialize)]
struct RawPayload {
    class: Option<String>,
    /// ActiveJob 包装任务的真实类名
    wrapped: Option<String>,
    jid: Option<String>,
    /// 部分宿主用 `id` 表示任务 ID；两者都有时以 `jid` 为准
    id: Option<String>,
    #[serde(default)]
    args: Vec<Value>,
}

impl JobIdentity {
    pub fn new(
        class: impl Into<String>,
        id: impl Into<String>,
        queue: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Self {
            class: class.into(),
            id: id.into(),
            queue: queue.into(),
            args,
        }
    }

    /// 从原始 JSON 负载解析任务身份
    ///
    /// 负载格式：`{"class": "...", "jid": "...", "args": [...]}`。
    /// ActiveJob 包装任务使用 `wrapped` 作为类名，参数取 `args[0].arguments`。
    pub fn parse(payload: &str, queue: &str) -> Result<Self> {
        let raw: RawPayload = serde_json::from_str(payload)
            .map_err(|e| ThrottleError::InvalidPayload(e.to_string()))?;

        let id = raw
            .jid
            .filter(|id| !id.is_empty())
            .or(raw.id.filter(|id| !id.is_empty()))
            .ok_or_else(|| ThrottleError::InvalidPayload("missing jid".to_string()))?;

        let (class, args) = match raw.wrapped.filter(|w| !w.is_empty()) {
            Some(wrapped) => {
                let args = raw
                    .args
                    .first()
                    .and_then(|first| first.get("arguments"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or(raw.args);
                (wrapped, args)
            }
            None => {
                let class = raw
                    .class
                    .filter(|c| !c.is_empty())
                    .ok_or_else(|| ThrottleError::InvalidPayload("missing class".to_string()))?;
                (class, raw.args)
            }
        };

        Ok(Self {
            class,
            id,
            queue: queue.to_string(),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plain_payload() {
        let payload = r#"{"class":"ReportJob","jid":"abc","args":[1,"acme"],"retry":true}"#;
        let job = JobIdentity::parse(payload, "default").unwrap();

        assert_eq!(job.class, "ReportJob");
        assert_eq!(job.id, "abc");
        assert_eq!(job.queue, "default");
        assert_eq!(job.args, vec![json!(1), json!("acme")]);
    }

    #[test]
    fn test_parse_wrapped_payload() {
        let payload = json!({
            "class": "ActiveJob::QueueAdapters::SidekiqAdapter::JobWrapper",
            "wrapped": "SyncTenantJob",
            "jid": "j-1",
            "args": [{"job_class": "SyncTenantJob", "arguments": [42]}]
        })
        .to_string();
        let job = JobIdentity::parse(&payload, "critical").unwrap();

        assert_eq!(job.class, "SyncTenantJob");
        assert_eq!(job.args, vec![json!(42)]);
    }

    #[test]
    fn test_parse_prefers_jid_over_id() {
        let payload = r#"{"class":"ReportJob","jid":"j-7","id":"row-3","args":[]}"#;
        let job = JobIdentity::parse(payload, "default").unwrap();
        assert_eq!(job.id, "j-7");

        let payload = r#"{"class":"ReportJob","id":"row-3"}"#;
        let job = JobIdentity::parse(payload, "default").unwrap();
        assert_eq!(job.id, "row-3");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(JobIdentity::parse("not json", "q").is_err());
        assert!(JobIdentity::parse(r#"{"jid":"1"}"#, "q").is_err());
        assert!(JobIdentity::parse(r#"{"class":"A"}"#, "q").is_err());
    }
}
