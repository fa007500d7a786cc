mod group;
mod handler;

pub use group::{ConsumerGroup, GroupContext, KafkaConsumerGroup};
pub use handler::{ConsumerGroupHandler, GroupSession, MessageHandler, DEFAULT_WORKERS_COUNT};

// Consumer keys known to the persistence service
pub const START_PROCESS_CONSUMER: &str = "start-process";
pub const CREATE_SERVICE_TASK_CONSUMER: &str = "create-service-task-consumer";
pub const FILE_UPLOAD_RESULT_CONSUMER: &str = "file-upload-result-consumer";
pub const REQUEST_ACTIONS_CONSUMER: &str = "request-actions-consumer";
pub const FALLBACK_CONSUMER: &str = "fallback-consumer";
pub const DELEGATES_RESPONSE_CONSUMER: &str = "delegates-response-consumer";
pub const CREATE_USER_TASK_CONSUMER: &str = "create-user-task-consumer";
pub const GROUP_LOGINS_RESPONSE_CONSUMER: &str = "group-logins-response-consumer";
