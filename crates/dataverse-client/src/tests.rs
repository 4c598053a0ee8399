/// HTTP-level tests for the token source and the gateway against a local
/// mock server.
#[cfg(test)]
mod http {
    use std::sync::Arc;
    use std::time::Duration;

    use mockito::Matcher;
    use serde_json::{json, Map};

    use crate::auth::{
        fetch_backoff, ClientCredentials, ClientCredentialsSource, CredentialManager, TokenSource,
    };
    use crate::error::{AuthError, ErrorKind};
    use crate::gateway::{Gateway, GatewayConfig, HttpGateway};
    use crate::odata::QueryFilter;
    use crate::types::{EntityDescriptor, MergeOptions, MergeRequest, RecordId};

    const MASTER: &str = "11111111-2222-4333-8444-555555555555";
    const DUPLICATE: &str = "66666666-7777-4888-9999-aaaaaaaaaaaa";

    fn credentials(authority: String) -> ClientCredentials {
        ClientCredentials {
            tenant_id: "tenant-1".into(),
            client_id: "app-1".into(),
            client_secret: "s3cret".into(),
            resource: "https://org.crm.dynamics.com".into(),
            scope: None,
            authority: Some(authority),
        }
    }

    fn source(server: &mockito::Server) -> ClientCredentialsSource {
        ClientCredentialsSource::new(
            reqwest::Client::new(),
            credentials(format!("{}/tenant-1", server.url())),
        )
        .with_base_delay(Duration::from_millis(1))
    }

    fn gateway(server: &mockito::Server) -> HttpGateway {
        let mut config = GatewayConfig::new(server.url());
        config.max_page_size = 2;
        HttpGateway::new(&config).unwrap()
    }

    // ─── Token endpoint ───────────────────────────────────────────────────

    #[tokio::test]
    async fn token_fetch_posts_client_credentials_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_query(Matcher::Any)
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "client_credentials".into()),
                Matcher::UrlEncoded("client_id".into(), "app-1".into()),
                Matcher::UrlEncoded("client_secret".into(), "s3cret".into()),
                Matcher::UrlEncoded(
                    "scope".into(),
                    "https://org.crm.dynamics.com/.default".into(),
                ),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"token_type":"Bearer","expires_in":3599,"access_token":"tok-1"}"#)
            .create_async()
            .await;

        let credential = source(&server).fetch().await.unwrap();
        assert_eq!(credential.access_token(), "tok-1");
        assert_eq!(credential.scope(), "https://org.crm.dynamics.com/.default");
        let lifetime = credential.expires_at() - chrono::Utc::now();
        assert!(lifetime > chrono::Duration::seconds(3500));
        assert!(!format!("{credential:?}").contains("tok-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn token_expires_in_may_be_a_string() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"expires_in":"600","access_token":"tok-s"}"#)
            .create_async()
            .await;

        let credential = source(&server).fetch().await.unwrap();
        assert_eq!(credential.access_token(), "tok-s");
    }

    #[tokio::test]
    async fn token_rejection_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(
                r#"{"error":"invalid_client","error_description":"AADSTS7000215: Invalid client secret provided."}"#,
            )
            .expect(1)
            .create_async()
            .await;

        let err = source(&server).fetch().await.unwrap_err();
        match err {
            AuthError::Rejected { error, description } => {
                assert_eq!(error, "invalid_client");
                assert!(description.starts_with("AADSTS7000215"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn token_server_errors_are_retried_then_unreachable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = source(&server).with_max_attempts(3).fetch().await.unwrap_err();
        assert!(matches!(err, AuthError::Unreachable { attempts: 3, .. }), "{err:?}");
        mock.assert_async().await;
    }

    #[test]
    fn token_backoff_doubles_up_to_cap() {
        let (base, max) = (Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(fetch_backoff(base, max, 1), Duration::from_millis(500));
        assert_eq!(fetch_backoff(base, max, 3), Duration::from_secs(2));
        assert_eq!(fetch_backoff(base, max, 8), max);
        // 2^40 does not fit in u32
        assert_eq!(fetch_backoff(base, max, 41), max);
        assert_eq!(fetch_backoff(base, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn many_token_attempts_stay_within_max_delay() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(40)
            .create_async()
            .await;

        let err = source(&server)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_max_attempts(40)
            .fetch()
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unreachable { attempts: 40, .. }), "{err:?}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn manager_caches_http_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tenant-1/oauth2/v2.0/token")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"expires_in":3599,"access_token":"tok-cached"}"#)
            .expect(1)
            .create_async()
            .await;

        let manager = CredentialManager::new(Arc::new(source(&server)), Duration::from_secs(180));
        assert_eq!(manager.get_token().await.unwrap(), "tok-cached");
        assert_eq!(manager.get_token().await.unwrap(), "tok-cached");
        mock.assert_async().await;
    }

    #[test]
    fn scope_and_authority_defaults() {
        let mut creds = credentials(String::new());
        creds.authority = None;
        creds.resource = "https://org.crm.dynamics.com/".into();
        assert_eq!(creds.scope(), "https://org.crm.dynamics.com/.default");
        assert_eq!(
            creds.token_url(),
            "https://login.microsoftonline.com/tenant-1/oauth2/v2.0/token"
        );
        assert!(!format!("{creds:?}").contains("s3cret"));
    }

    // ─── Gateway ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn query_follows_next_link() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/api/data/v9.2/accounts?$skiptoken=page2", server.url());
        let first = server
            .mock("GET", "/api/data/v9.2/accounts")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("$filter".into(), "accountnumber eq 'BUS-1'".into()),
                Matcher::UrlEncoded("$select".into(), "accountid,name".into()),
            ]))
            .match_header("authorization", "Bearer tok")
            .match_header("prefer", "odata.maxpagesize=2")
            .match_header("odata-version", "4.0")
            .with_status(200)
            .with_body(
                json!({
                    "value": [{"accountid": MASTER, "name": "Acme"}],
                    "@odata.nextLink": next,
                })
                .to_string(),
            )
            .create_async()
            .await;
        let second = server
            .mock("GET", "/api/data/v9.2/accounts")
            .match_query(Matcher::UrlEncoded("$skiptoken".into(), "page2".into()))
            .with_status(200)
            .with_body(json!({"value": [{"accountid": DUPLICATE, "name": "Acme Inc"}]}).to_string())
            .create_async()
            .await;

        let filter = QueryFilter::eq("accountnumber", "BUS-1").select(["accountid", "name"]);
        let records = gateway(&server)
            .query("tok", &EntityDescriptor::account(), &filter)
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.to_string(), MASTER);
        assert_eq!(records[1].field_str("name"), Some("Acme Inc"));
        assert_eq!(records[1].entity, "account");
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn query_stops_at_page_limit() {
        let mut server = mockito::Server::new_async().await;
        let next = format!("{}/api/data/v9.2/accounts?$skiptoken=more", server.url());
        server
            .mock("GET", "/api/data/v9.2/accounts")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"value": [{"accountid": MASTER}], "@odata.nextLink": next}).to_string())
            .expect(1)
            .create_async()
            .await;

        let mut config = GatewayConfig::new(server.url());
        config.max_pages = 1;
        let gw = HttpGateway::new(&config).unwrap();
        let records = gw
            .query("tok", &EntityDescriptor::account(), &QueryFilter::new())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn throttled_response_carries_retry_after() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/data/v9.2/accounts")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("Retry-After", "7")
            .with_body(r#"{"error":{"code":"0x80072322","message":"Number of requests exceeded the limit of 6000 over time window of 300 seconds."}}"#)
            .create_async()
            .await;

        let err = gateway(&server)
            .query("tok", &EntityDescriptor::account(), &QueryFilter::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Throttled);
        assert!(err.retryable);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(err.code.as_deref(), Some("0x80072322"));
    }

    #[tokio::test]
    async fn unauthorized_and_not_found_are_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/data/v9.2/accounts")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("GET", "/api/data/v9.2/widgets")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"error":{"code":"0x80060888","message":"Resource not found for the segment 'widgets'."}}"#)
            .create_async()
            .await;

        let gw = gateway(&server);
        let err = gw
            .query("stale", &EntityDescriptor::account(), &QueryFilter::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
        assert!(!err.retryable);

        let mut widgets = EntityDescriptor::account();
        widgets.entity_set = "widgets".into();
        let err = gw.query("tok", &widgets, &QueryFilter::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.detail.contains("widgets"));
    }

    #[tokio::test]
    async fn merge_posts_action_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/data/v9.2/Merge")
            .match_query(Matcher::Any)
            .match_body(Matcher::PartialJson(json!({
                "Target": {"@odata.type": "Microsoft.Dynamics.CRM.account", "accountid": MASTER},
                "Subordinate": {"@odata.type": "Microsoft.Dynamics.CRM.account", "accountid": DUPLICATE},
                "PerformParentingChecks": false,
            })))
            .with_status(204)
            .create_async()
            .await;

        let entity = EntityDescriptor::account();
        let options = MergeOptions::default();
        let request = MergeRequest {
            entity: &entity,
            master: MASTER.parse().unwrap(),
            duplicate: DUPLICATE.parse().unwrap(),
            options: &options,
        };
        gateway(&server).merge("tok", &request).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn merge_conflict_is_not_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/data/v9.2/Merge")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(r#"{"error":{"code":"0x8004d24b","message":"The subordinate record was already merged."}}"#)
            .create_async()
            .await;

        let entity = EntityDescriptor::account();
        let options = MergeOptions::default();
        let request = MergeRequest {
            entity: &entity,
            master: MASTER.parse().unwrap(),
            duplicate: DUPLICATE.parse().unwrap(),
            options: &options,
        };
        let err = gateway(&server).merge("tok", &request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn update_patches_record() {
        let mut server = mockito::Server::new_async().await;
        let path = format!("/api/data/v9.2/accounts({MASTER})");
        let mock = server
            .mock("PATCH", path.as_str())
            .match_query(Matcher::Any)
            .match_header("if-match", "*")
            .match_body(Matcher::Json(json!({"statecode": 1, "statuscode": 2})))
            .with_status(204)
            .create_async()
            .await;

        let mut fields = Map::new();
        fields.insert("statecode".into(), json!(1));
        fields.insert("statuscode".into(), json!(2));
        gateway(&server)
            .update("tok", &EntityDescriptor::account(), MASTER.parse().unwrap(), &fields)
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn create_returns_entity_id_and_delete_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let created = format!("{}/api/data/v9.2/annotations({DUPLICATE})", server.url());
        server
            .mock("POST", "/api/data/v9.2/annotations")
            .match_query(Matcher::Any)
            .match_header("prefer", "return=representation")
            .with_status(204)
            .with_header("OData-EntityId", &created)
            .create_async()
            .await;
        let path = format!("/api/data/v9.2/annotations({DUPLICATE})");
        let delete = server
            .mock("DELETE", path.as_str())
            .match_query(Matcher::Any)
            .with_status(204)
            .create_async()
            .await;

        let gw = gateway(&server);
        let body = json!({"subject": "Merge summary", "notetext": "merged"});
        let id = gw.create("tok", "annotations", &body).await.unwrap();
        let expected: RecordId = DUPLICATE.parse().unwrap();
        assert_eq!(id, Some(expected));

        gw.delete("tok", "annotations", expected).await.unwrap();
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        let config = GatewayConfig {
            timeout: Duration::from_secs(2),
            ..GatewayConfig::new("http://127.0.0.1:1")
        };
        let err = HttpGateway::new(&config)
            .unwrap()
            .query("tok", &EntityDescriptor::account(), &QueryFilter::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Transient);
        assert!(err.retryable);
        assert!(err.status.is_none());
    }

    #[test]
    fn rejects_non_http_base_uri() {
        assert!(HttpGateway::new(&GatewayConfig::new("org.crm.dynamics.com")).is_err());
        assert_eq!(
            GatewayConfig::new("https://org.crm.dynamics.com/").webapi_url(),
            "https://org.crm.dynamics.com/api/data/v9.2"
        );
    }
}
