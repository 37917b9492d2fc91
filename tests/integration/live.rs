//! Smoke tests against a running cluster

use gridwire::SqlConnection;

use crate::{get_cluster_config, skip_if_not_enabled};

#[test]
fn test_live_select() {
    skip_if_not_enabled!();

    let config = get_cluster_config();
    let connection = SqlConnection::connect(&config).expect("Failed to connect to cluster");
    let mut session = connection.create_session().expect("Failed to create session");

    let result = session.query("SELECT 1").expect("SELECT should succeed");
    assert!(result.table_found());
    assert_eq!(result.page.as_ref().map(|p| p.row_count), Some(1));

    session.close();
    connection.close().expect("Close should succeed");
}

#[test]
fn test_live_update_count() {
    skip_if_not_enabled!();

    let config = get_cluster_config();
    let connection = SqlConnection::connect(&config).expect("Failed to connect to cluster");
    let mut session = connection.create_session().expect("Failed to create session");

    session
        .update("DROP TABLE IF EXISTS gridwire_it")
        .expect("DROP should succeed");
    session
        .update("CREATE TABLE gridwire_it (id INTEGER PRIMARY KEY, v STRING)")
        .expect("CREATE should succeed");
    let count = session
        .update("INSERT INTO gridwire_it VALUES (1, 'a'), (2, 'b')")
        .expect("INSERT should succeed");
    assert_eq!(count, 2);

    let result = session
        .query("SELECT * FROM gridwire_it")
        .expect("SELECT should succeed");
    assert_eq!(result.page.as_ref().map(|p| p.row_count), Some(2));
}
