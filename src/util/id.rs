use uuid::Uuid;

pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

pub fn chat_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}
