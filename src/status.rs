//! Best-effort status reporting. The engine pushes operational state to a
//! sink after significant transitions; a failing sink never affects cache
//! behavior, so every push site ignores the returned error after logging it.

use serde_json::Value;

pub trait StatusSink: Send + Sync {
    /// Report a service-level state change, e.g. precache started/finished.
    fn update_service(
        &self,
        name: &str,
        state: &str,
        message: &str,
        data: Value,
    ) -> std::io::Result<()>;

    /// Append one line to the operational log stream.
    fn append_log(
        &self,
        name: &str,
        level: &str,
        message: &str,
        data: &Value,
    ) -> std::io::Result<()>;
}

/// Sink that discards everything.
#[derive(Default)]
pub struct NullStatusSink;

impl StatusSink for NullStatusSink {
    fn update_service(&self, _: &str, _: &str, _: &str, _: Value) -> std::io::Result<()> {
        Ok(())
    }

    fn append_log(&self, _: &str, _: &str, _: &str, _: &Value) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub mod test_sinks {
    use super::*;
    use parking_lot::Mutex;

    /// Records every push for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        pub updates: Mutex<Vec<(String, String, String, Value)>>,
        pub logs: Mutex<Vec<(String, String, String, Value)>>,
    }

    impl StatusSink for RecordingSink {
        fn update_service(
            &self,
            name: &str,
            state: &str,
            message: &str,
            data: Value,
        ) -> std::io::Result<()> {
            self.updates.lock().push((
                name.to_string(),
                state.to_string(),
                message.to_string(),
                data,
            ));
            Ok(())
        }

        fn append_log(
            &self,
            name: &str,
            level: &str,
            message: &str,
            data: &Value,
        ) -> std::io::Result<()> {
            self.logs.lock().push((
                name.to_string(),
                level.to_string(),
                message.to_string(),
                data.clone(),
            ));
            Ok(())
        }
    }

    /// Fails every push, for verifying the engine shrugs it off.
    #[derive(Default)]
    pub struct FailingSink;

    impl StatusSink for FailingSink {
        fn update_service(&self, _: &str, _: &str, _: &str, _: Value) -> std::io::Result<()> {
            Err(std::io::Error::other("sink down"))
        }

        fn append_log(&self, _: &str, _: &str, _: &str, _: &Value) -> std::io::Result<()> {
            Err(std::io::Error::other("sink down"))
        }
    }
}
