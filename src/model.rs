use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::format;
use crate::store::Document;

pub const POSTS: &str = "posts";
pub const COMMENTS: &str = "comments";
pub const USERS: &str = "users";
pub const ACCOUNTS: &str = "accounts";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("{collection}/{id}: missing field `{field}`")]
    MissingField {
        collection: &'static str,
        id: String,
        field: &'static str,
    },
    #[error("{collection}/{id}: field `{field}` should be {expected}")]
    WrongType {
        collection: &'static str,
        id: String,
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    pub images: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub comments: Vec<String>,
    pub nickname: Option<String>,
    pub profile_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub user_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub nickname: Option<String>,
    pub photo_url: Option<String>,
}

/// Source of truth for the display fields copied onto posts and comments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub nickname: String,
    pub profile_image_url: String,
}

impl UserProfile {
    pub fn nickname(&self) -> Option<&str> {
        non_empty(&self.nickname)
    }

    pub fn profile_image_url(&self) -> Option<&str> {
        non_empty(&self.profile_image_url)
    }
}

impl TryFrom<&Document> for Post {
    type Error = DecodeError;

    fn try_from(doc: &Document) -> Result<Self, Self::Error> {
        let r = Reader::new(POSTS, doc);
        Ok(Post {
            id: doc.id.clone(),
            user_id: r.required_str("userId")?,
            title: r.optional_str("title")?.unwrap_or_default(),
            content: r.optional_str("content")?.unwrap_or_default(),
            images: r.string_list("images")?,
            created_at: r.timestamp("createdAt")?,
            comments: r.string_list("comments")?,
            nickname: r.cached("nickname")?,
            profile_image_url: r.cached("profileImageURL")?,
        })
    }
}

impl TryFrom<&Document> for Comment {
    type Error = DecodeError;

    fn try_from(doc: &Document) -> Result<Self, Self::Error> {
        let r = Reader::new(COMMENTS, doc);
        Ok(Comment {
            id: doc.id.clone(),
            post_id: r.required_str("postId")?,
            user_id: r.required_str("userId")?,
            body: r.optional_str("comment")?.unwrap_or_default(),
            created_at: r.timestamp("createdAt")?,
            nickname: r.cached("userNickname")?,
            photo_url: r.cached("userPhotoURL")?,
        })
    }
}

impl TryFrom<&Document> for UserProfile {
    type Error = DecodeError;

    fn try_from(doc: &Document) -> Result<Self, Self::Error> {
        let r = Reader::new(USERS, doc);
        // Older profiles stored the avatar under `photoURL`.
        let avatar = match r.optional_str("profileImageURL")? {
            Some(url) => Some(url),
            None => r.optional_str("photoURL")?,
        };
        Ok(UserProfile {
            nickname: r.optional_str("nickname")?.unwrap_or_default(),
            profile_image_url: avatar.unwrap_or_default(),
        })
    }
}

/// Post body as written on creation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewPost<'a> {
    pub user_id: &'a str,
    pub title: &'a str,
    pub content: &'a str,
    pub images: &'a [String],
    pub created_at: String,
    pub comments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<&'a str>,
    #[serde(rename = "profileImageURL", skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub(crate) struct PostEdit<'a> {
    pub title: &'a str,
    pub content: &'a str,
    pub images: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NewComment<'a> {
    pub post_id: &'a str,
    pub user_id: &'a str,
    pub comment: &'a str,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_nickname: Option<&'a str>,
    #[serde(rename = "userPhotoURL", skip_serializing_if = "Option::is_none")]
    pub user_photo_url: Option<&'a str>,
}

struct Reader<'a> {
    collection: &'static str,
    doc: &'a Document,
}

impl<'a> Reader<'a> {
    fn new(collection: &'static str, doc: &'a Document) -> Self {
        Self { collection, doc }
    }

    fn missing(&self, field: &'static str) -> DecodeError {
        DecodeError::MissingField {
            collection: self.collection,
            id: self.doc.id.clone(),
            field,
        }
    }

    fn wrong_type(&self, field: &'static str, expected: &'static str) -> DecodeError {
        DecodeError::WrongType {
            collection: self.collection,
            id: self.doc.id.clone(),
            field,
            expected,
        }
    }

    fn optional_str(&self, field: &'static str) -> Result<Option<String>, DecodeError> {
        match self.doc.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(_) => Err(self.wrong_type(field, "a string")),
        }
    }

    fn required_str(&self, field: &'static str) -> Result<String, DecodeError> {
        match self.optional_str(field)? {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(self.missing(field)),
        }
    }

    fn cached(&self, field: &'static str) -> Result<Option<String>, DecodeError> {
        Ok(self.optional_str(field)?.filter(|text| !text.is_empty()))
    }

    fn string_list(&self, field: &'static str) -> Result<Vec<String>, DecodeError> {
        match self.doc.get(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(text) => Ok(text.clone()),
                    _ => Err(self.wrong_type(field, "a list of strings")),
                })
                .collect(),
            Some(_) => Err(self.wrong_type(field, "a list of strings")),
        }
    }

    fn timestamp(&self, field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
        match self.doc.get(field) {
            None | Some(Value::Null) => Err(self.missing(field)),
            Some(value) => {
                format::parse_timestamp(value).ok_or_else(|| self.wrong_type(field, "a timestamp"))
            }
        }
    }
}

fn non_empty(text: &str) -> Option<&str> {
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, value: Value) -> Document {
        match value {
            Value::Object(fields) => Document {
                id: id.into(),
                fields,
            },
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn decodes_post_with_defaults() {
        let post = Post::try_from(&doc(
            "p1",
            json!({"userId": "u1", "createdAt": "2024-05-01T10:00:00.000Z", "nickname": ""}),
        ))
        .unwrap();
        assert_eq!(post.user_id, "u1");
        assert_eq!(post.title, "");
        assert!(post.images.is_empty());
        assert_eq!(post.nickname, None);
    }

    #[test]
    fn post_without_owner_is_rejected() {
        let err = Post::try_from(&doc("p1", json!({"createdAt": "2024-05-01T10:00:00Z"})))
            .unwrap_err();
        assert_eq!(
            err,
            DecodeError::MissingField {
                collection: POSTS,
                id: "p1".into(),
                field: "userId",
            }
        );
    }

    #[test]
    fn malformed_fields_name_the_field() {
        let err = Post::try_from(&doc(
            "p2",
            json!({"userId": "u1", "createdAt": "2024-05-01T10:00:00Z", "images": "a.png"}),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("`images`"));

        let err = Comment::try_from(&doc(
            "c1",
            json!({"postId": "p1", "userId": "u1", "createdAt": "soon"}),
        ))
        .unwrap_err();
        assert!(matches!(err, DecodeError::WrongType { field: "createdAt", .. }));
    }

    #[test]
    fn profile_reads_legacy_avatar_field() {
        let profile =
            UserProfile::try_from(&doc("u1", json!({"nickname": "mina", "photoURL": "x.png"})))
                .unwrap();
        assert_eq!(profile.nickname(), Some("mina"));
        assert_eq!(profile.profile_image_url(), Some("x.png"));
    }

    #[test]
    fn new_post_serializes_wire_names() {
        let images = vec!["a.png".to_string()];
        let body = crate::store::fields_of(&NewPost {
            user_id: "u1",
            title: "t",
            content: "c",
            images: &images,
            created_at: "2024-05-01T10:00:00.000Z".into(),
            comments: Vec::new(),
            nickname: Some("mina"),
            profile_image_url: None,
        })
        .unwrap();
        assert_eq!(body.get("userId"), Some(&json!("u1")));
        assert_eq!(body.get("nickname"), Some(&json!("mina")));
        assert!(!body.contains_key("profileImageURL"));
    }
}
