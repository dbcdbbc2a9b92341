//! Stream topology: which streams exist and what subjects they capture.

use lh_protocol::subject;

use crate::bus::EventBus;

pub const RAW_STREAM: &str = "raw";
pub const EVENTS_STREAM: &str = "events";
pub const DLQ_STREAM: &str = "map_fail";

/// Create the three streams the pipeline runs on. Idempotent.
pub fn create_streams(bus: &EventBus, raw_subject: &str) {
    bus.add_stream(RAW_STREAM, &[raw_subject]);
    let events_filter = format!("{}.>", subject::EVENTS_PREFIX);
    bus.add_stream(EVENTS_STREAM, &[&events_filter]);
    bus.add_stream(DLQ_STREAM, &[subject::MAP_FAIL_SUBJECT]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_streams_capture_their_subjects() {
        let bus = EventBus::new();
        create_streams(&bus, subject::RAW_SUBJECT);

        bus.publish(subject::RAW_SUBJECT, b"raw".to_vec()).unwrap();
        bus.publish("langhook.events.github.issue.1.created", b"evt".to_vec())
            .unwrap();
        bus.publish(subject::MAP_FAIL_SUBJECT, b"dlq".to_vec()).unwrap();

        assert_eq!(bus.get_stream(RAW_STREAM).unwrap().len(), 1);
        assert_eq!(bus.get_stream(EVENTS_STREAM).unwrap().len(), 1);
        assert_eq!(bus.get_stream(DLQ_STREAM).unwrap().len(), 1);
    }
}
