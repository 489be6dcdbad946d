// src/api_tests.rs

#[cfg(test)]
mod tests {
    use crate::api::{router, AppState, LedgerSettings};
    use crate::clock::ManualClock;
    use crate::local_store::MemoryStorage;
    use crate::records::{Employee, EmployeeStatus, Project};
    use crate::remote::InMemoryRemoteStore;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        state: AppState,
        remote: Arc<InMemoryRemoteStore>,
    }

    impl TestApp {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let remote = Arc::new(InMemoryRemoteStore::new("https://ledger.example.com"));
            let clock = Arc::new(ManualClock::new("2024-05-06 09:00:00"));
            let settings = LedgerSettings {
                user_id: "u1".to_string(),
                debounce: std::time::Duration::from_millis(10),
                ..Default::default()
            };
            let state = AppState::build(storage, remote.clone(), remote.clone(), clock, &settings);

            state
                .projects
                .upsert(&Project {
                    project_id: "p1".to_string(),
                    project_name: "North tower".to_string(),
                    regular_hours: Some(dec!(8)),
                    overtime_hours: Some(dec!(6)),
                })
                .unwrap();
            state
                .employees
                .upsert(&Employee {
                    employee_id: "e1".to_string(),
                    project_id: "p1".to_string(),
                    emp_code: "001".to_string(),
                    emp_name: "张三".to_string(),
                    labor_cost: Some(dec!(200)),
                    status: EmployeeStatus::Active,
                })
                .unwrap();

            Self { state, remote }
        }

        fn app(&self) -> Router {
            router(self.state.clone())
        }

        async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
            let builder = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.app().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, bytes.to_vec())
        }

        async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let (status, bytes) = self.send(method, uri, body).await;
            (status, serde_json::from_slice(&bytes).unwrap())
        }

        async fn point_work(&self, day: u32, hours: &str) -> StatusCode {
            let body = json!({
                "project_id": "p1",
                "employee_id": "e1",
                "record_date": format!("2024-05-{:02}", day),
                "work_type": "点工",
                "regular_hours": hours
            });
            self.json("POST", "/api/attendance", Some(body)).await.0
        }

        async fn payment(&self, day: u32, record_type: &str, amount: &str) -> (StatusCode, Value) {
            let body = json!({
                "project_id": "p1",
                "employee_id": "e1",
                "record_date": format!("2024-05-{:02}", day),
                "record_type": record_type,
                "amount": amount
            });
            self.json("POST", "/api/settlements", Some(body)).await
        }
    }

    #[tokio::test]
    async fn test_status_reports_pending_sync() {
        let app = TestApp::new();
        let (status, body) = app.json("GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["pending_sync"], 0);
    }

    #[tokio::test]
    async fn test_created_records_show_up_in_worker_view() {
        let app = TestApp::new();
        assert_eq!(app.point_work(1, "8").await, StatusCode::CREATED);
        assert_eq!(app.point_work(2, "2").await, StatusCode::CREATED);
        let (status, _) = app.payment(2, "借支", "200").await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, rows) = app.json("GET", "/api/projects/p1/workers", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["emp_name"], "张三");
        assert_eq!(rows[0]["regular_days"], "1.25");
        assert_eq!(rows[0]["point_work_amount"], "250");
        assert_eq!(rows[0]["expense"], "200");
        assert_eq!(rows[0]["unsettled"], "50");
    }

    #[tokio::test]
    async fn test_offline_create_is_accepted_and_queued() {
        let app = TestApp::new();
        app.remote.set_reachable(false);

        assert_eq!(app.point_work(1, "8").await, StatusCode::ACCEPTED);

        let (_, status_body) = app.json("GET", "/status", None).await;
        assert_eq!(status_body["pending_sync"], 1);
        let (status, entries) = app.json("GET", "/api/sync-queue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entries[0]["type"], "save_record");

        let (_, rows) = app.json("GET", "/api/projects/p1/workers", None).await;
        assert_eq!(rows[0]["point_work_amount"], "200");
    }

    #[tokio::test]
    async fn test_invalid_record_is_unprocessable() {
        let app = TestApp::new();
        let body = json!({
            "project_id": "p1",
            "employee_id": "e1",
            "record_date": "2024-05-01",
            "work_type": "包工"
        });
        let (status, body) = app.json("POST", "/api/attendance", Some(body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("contract_amount"));
    }

    #[tokio::test]
    async fn test_unknown_type_filter_is_bad_request() {
        let app = TestApp::new();
        let (status, _) = app
            .json("GET", "/api/projects/p1/workers?type=overtime", None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_date_and_type_filters_narrow_the_view() {
        let app = TestApp::new();
        app.point_work(1, "8").await;
        app.point_work(3, "8").await;
        app.payment(3, "借支", "100").await;

        let (_, rows) = app
            .json("GET", "/api/projects/p1/workers?date=2024-05-03&type=point_work", None)
            .await;
        assert_eq!(rows[0]["regular_days"], "1.00");
        assert_eq!(rows[0]["advance"], "0");

        let (_, rows) = app
            .json("GET", "/api/projects/p1/workers?from=2024-05-02", None)
            .await;
        assert_eq!(rows[0]["point_work_amount"], "200");
        assert_eq!(rows[0]["advance"], "100");
    }

    #[tokio::test]
    async fn test_settle_refused_while_worker_is_owed() {
        let app = TestApp::new();
        for day in 1..=5 {
            assert_eq!(app.point_work(day, "8").await, StatusCode::CREATED);
        }
        app.payment(5, "借支", "400").await;

        let (_, unsettled) = app.json("GET", "/api/projects/p1/unsettled", None).await;
        assert_eq!(unsettled["owed"][0]["display"], "600");

        let (status, body) = app
            .json("POST", "/api/employees/e1/settle", Some(json!({ "confirm": true })))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
        assert_eq!(
            app.state.employees.get("e1").unwrap().status,
            EmployeeStatus::Active
        );
    }

    #[tokio::test]
    async fn test_settle_after_final_payment() {
        let app = TestApp::new();
        for day in 1..=5 {
            app.point_work(day, "8").await;
        }
        app.payment(5, "借支", "400").await;
        app.payment(6, "结算", "600").await;

        let (status, _) = app
            .json("POST", "/api/employees/e1/settle", Some(json!({ "confirm": false })))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = app
            .json("POST", "/api/employees/e1/settle", Some(json!({ "confirm": true })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(
            app.state.employees.get("e1").unwrap().status,
            EmployeeStatus::Settled
        );

        let (_, unsettled) = app.json("GET", "/api/projects/p1/unsettled", None).await;
        assert_eq!(unsettled["owed"].as_array().unwrap().len(), 0);
        assert_eq!(unsettled["settled"][0]["status"], "结清");

        let (status, _) = app.json("POST", "/api/employees/e1/unsettle", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            app.state.employees.get("e1").unwrap().status,
            EmployeeStatus::Active
        );
    }

    #[tokio::test]
    async fn test_update_and_delete_of_unknown_record_is_not_found() {
        let app = TestApp::new();
        let (status, _) = app
            .json("PUT", "/api/attendance/att_missing", Some(json!({ "regular_hours": "4" })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app.json("DELETE", "/api/settlements/stl_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_audit_and_delete_settlement() {
        let app = TestApp::new();
        let (_, created) = app.payment(2, "借支", "300").await;
        let id = created["data"]["settlement_id"].as_str().unwrap().to_string();

        let (status, audited) = app
            .json("POST", &format!("/api/settlements/{}/audit", id), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audited["data"]["audit_status"], "已审核");

        let (status, updated) = app
            .json("PUT", &format!("/api/settlements/{}", id), Some(json!({ "amount": "350" })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["data"]["audit_status"], "已审核");

        let (_, rows) = app.json("GET", "/api/projects/p1/workers", None).await;
        assert_eq!(rows[0]["advance"], "350");

        let (status, _) = app.json("DELETE", &format!("/api/settlements/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, rows) = app.json("GET", "/api/projects/p1/workers", None).await;
        assert_eq!(rows.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_image_upload_through_api() {
        let app = TestApp::new();
        let body = json!({
            "project_id": "p1",
            "employee_id": "e1",
            "record_date": "2024-05-01",
            "work_type": "点工",
            "regular_hours": "8",
            "images": [{ "file_name": "site.jpg", "data_base64": "/9j/4AAQ" }]
        });
        let (status, created) = app.json("POST", "/api/attendance", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        let url = created["data"]["image_ids"][0].as_str().unwrap();
        assert!(url.starts_with("https://ledger.example.com/"));
        assert!(url.ends_with("site.jpg"));

        let body = json!({
            "project_id": "p1",
            "employee_id": "e1",
            "record_date": "2024-05-01",
            "work_type": "点工",
            "regular_hours": "8",
            "images": [{ "file_name": "bad.jpg", "data_base64": "not base64!" }]
        });
        let (status, _) = app.json("POST", "/api/attendance", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_flow_and_csv_views() {
        let app = TestApp::new();
        app.payment(1, "借支", "100").await;
        app.point_work(1, "8").await;

        let (status, flow) = app.json("GET", "/api/projects/p1/flow", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(flow["lines"][0]["label"], "点工");
        assert_eq!(flow["lines"][1]["label"], "借支");

        let (status, csv) = app.send("GET", "/api/projects/p1/workers.csv", None).await;
        assert_eq!(status, StatusCode::OK);
        let csv = String::from_utf8(csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("001,张三,在职,1.00,0.00,200,"));
        assert!(lines[2].starts_with("合计,1人,"));
    }
}
