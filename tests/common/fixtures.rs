use serde_json::Value;
use skein::channels::Channel;

/// Reducer channel concatenating string writes onto the current value.
pub fn concat_string() -> Channel {
    Channel::reducer(|current: Option<Value>, writes: Vec<Value>| {
        let mut acc = current
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        for write in writes {
            if let Some(s) = write.as_str() {
                acc.push_str(s);
            }
        }
        Ok(Value::String(acc))
    })
}

/// Reducer channel concatenating array writes onto the current array.
pub fn concat_array() -> Channel {
    Channel::reducer(|current: Option<Value>, writes: Vec<Value>| {
        let mut acc = match current {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        for write in writes {
            match write {
                Value::Array(items) => acc.extend(items),
                other => acc.push(other),
            }
        }
        Ok(Value::Array(acc))
    })
}

/// Aggregate channel summing integer writes.
pub fn sum_channel() -> Channel {
    Channel::aggregate(|a, b| {
        serde_json::json!(a.as_i64().unwrap_or(0) + b.as_i64().unwrap_or(0))
    })
}
