use objloader_types::ObjectId;

/// HTTP endpoint paths on an object server.
pub mod endpoints {
    /// `POST {server}/api/getobjects/{stream}` streams many objects.
    pub const GET_OBJECTS: &str = "/api/getobjects";
    /// `GET {server}/objects/{stream}/{object}/single` returns one object.
    pub const OBJECTS: &str = "/objects";
    pub const SINGLE_SUFFIX: &str = "/single";
}

/// URLs for one stream on one server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEndpoints {
    server_url: String,
    stream_id: String,
}

impl ServerEndpoints {
    pub fn new(server_url: &str, stream_id: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            stream_id: stream_id.to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Batch download URL.
    pub fn get_objects_url(&self) -> String {
        format!("{}{}/{}", self.server_url, endpoints::GET_OBJECTS, self.stream_id)
    }

    /// Single object URL.
    pub fn single_object_url(&self, object_id: &ObjectId) -> String {
        format!(
            "{}{}/{}/{}{}",
            self.server_url,
            endpoints::OBJECTS,
            self.stream_id,
            object_id,
            endpoints::SINGLE_SUFFIX
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_urls() {
        let ep = ServerEndpoints::new("https://app.example.com/", "s1");
        assert_eq!(ep.get_objects_url(), "https://app.example.com/api/getobjects/s1");
        assert_eq!(
            ep.single_object_url(&ObjectId::new("abc")),
            "https://app.example.com/objects/s1/abc/single"
        );
    }
}
