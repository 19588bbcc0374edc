/// Offline warehouse for `provider: fixture`. Statement results are matched
/// on whitespace-normalized SQL.
pub const FIXTURE_YAML: &str = r#"history:
  - query_id: 01b8e0a1-0000-0001
    query_text: SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id WHERE o.status = 'OPEN' ORDER BY o.id
    execution_time_ms: 12400
    bytes_scanned: 500000
    start_time: "2024-05-02T09:14:00Z"
  - query_id: 01b8e0a1-0000-0002
    query_text: SELECT COUNT(*) AS n FROM events
    execution_time_ms: 3100
    bytes_scanned: 9800000
    start_time: "2024-05-02T10:01:00Z"
  - query_id: 01b8e0a1-0000-0003
    query_text: INSERT INTO audit SELECT * FROM events
    execution_time_ms: 50000
    bytes_scanned: 1
    query_type: INSERT
tables:
  - name: ORDERS
    columns:
      - { name: ID, data_type: "NUMBER(38,0)" }
      - { name: CUSTOMER_ID, data_type: "NUMBER(38,0)" }
      - { name: STATUS, data_type: VARCHAR }
  - name: CUSTOMERS
    columns:
      - { name: ID, data_type: "NUMBER(38,0)" }
      - { name: NAME, data_type: VARCHAR }
  - name: EVENTS
    columns:
      - { name: ID, data_type: "NUMBER(38,0)" }
statements:
  - sql: SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id WHERE o.status = 'OPEN' ORDER BY o.id
    columns: [ID, NAME]
    rows:
      - [1, acme]
      - [2, globex]
      - [3, initech]
    execution_time_ms: 12400
    bytes_scanned: 500000
  - sql: SELECT COUNT(*) AS n FROM events
    columns: [N]
    rows:
      - [42]
    execution_time_ms: 3100
    bytes_scanned: 9800000
"#;
