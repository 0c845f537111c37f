/// 去掉地址末尾多余的 `/`
pub fn trim_base(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// 拼接服务地址与路径，保证中间只有一个 `/`
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", trim_base(base), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(
            join_url("http://localhost:8080/", "/v1/video/x/status"),
            "http://localhost:8080/v1/video/x/status"
        );
        assert_eq!(join_url("http://h", "status"), "http://h/status");
        assert_eq!(trim_base("http://h//"), "http://h");
    }
}
