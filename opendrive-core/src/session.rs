use serde::{Deserialize, Serialize};

#[derive(Serialize)]
pub(crate) struct Credentials<'a> {
    pub username: &'a str,
    pub passwd: &'a str,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SessionInfo {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "UserName", default)]
    pub user_name: Option<String>,
    #[serde(rename = "UserLang", default)]
    pub user_lang: Option<String>,
}
