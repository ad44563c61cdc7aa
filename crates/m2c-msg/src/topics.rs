//! ---
//! m2c_section: "02-messaging-ipc-data-model"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Topic names of the control, reply and data channels."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---

/// Inbound control topic of a connection.
pub fn job_topic(connection: &str) -> String {
    format!("m2c2/job/{connection}")
}

/// Informational replies.
pub fn info_topic(connection: &str) -> String {
    format!("m2c2/info/{connection}")
}

/// Error replies.
pub fn error_topic(connection: &str) -> String {
    format!("m2c2/error/{connection}")
}

/// Data published by the IoT-topic sink.
pub fn data_topic(connection: &str, machine: &str, tag: &str) -> String {
    format!("m2c2/data/{connection}/{machine}/{tag}")
}

/// MQTT filter matching with `+` (one level) and a trailing `#` (rest).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}
