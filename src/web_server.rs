use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::Config;
use crate::queue::JobQueue;
use crate::routes::submissions::{
    delete_submission_handler, get_submission_handler, post_grading_handler,
    post_submission_handler,
};
use crate::routes::{get_health_handler, get_workers_handler, json_error_handler, query_error_handler};

pub fn build_server(
    config: Arc<Config>,
    db_pool: Arc<SqlitePool>,
    queue: Arc<JobQueue>,
) -> std::io::Result<Server> {
    let bind_address = config
        .server
        .bind_address
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let bind_port = config.server.bind_port.unwrap_or(2358);

    let config = web::Data::from(config);
    let db_pool = web::Data::from(db_pool);
    let queue = web::Data::from(queue);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(config.clone())
            .app_data(db_pool.clone())
            .app_data(queue.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .app_data(web::QueryConfig::default().error_handler(query_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_submission_handler)
            .service(post_grading_handler)
            .service(get_submission_handler)
            .service(delete_submission_handler)
            .service(get_workers_handler)
            .service(get_health_handler)
    })
    .bind((bind_address, bind_port))?
    .run();

    Ok(server)
}
