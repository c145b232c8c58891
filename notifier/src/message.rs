use subredmonitor_core::CandidateItem;

pub const APPLICATION: &str = "subredmonitor";
pub const HIT_EVENT: &str = "Hit";

/// Backend-neutral alert content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub application: String,
    pub event: String,
    pub description: String,
    pub url: String,
}

impl Notification {
    pub fn for_item(item: &CandidateItem) -> Self {
        Self {
            application: APPLICATION.to_string(),
            event: HIT_EVENT.to_string(),
            description: item.title.clone(),
            url: item.permalink_url(),
        }
    }
}
