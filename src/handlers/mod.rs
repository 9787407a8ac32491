// Subtitle API HTTP handlers
//
// This module contains the HTTP handlers for the subtitle API.
// It provides the interface between HTTP requests and the task orchestrator.

pub mod form;
pub mod routes;


use actix_web::web;

// Re-export handlers for easier access
pub use self::routes::{
    create_remote_task, create_task, delete_task, health, list_tasks, metrics_handler,
    supported_formats, task_status, task_subtitle, task_video,
};

/// Register every route of the API
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(create_remote_task)
        .service(create_task)
        .service(list_tasks)
        .service(task_subtitle)
        .service(task_video)
        .service(task_status)
        .service(delete_task)
        .service(health)
        .service(supported_formats)
        .service(metrics_handler);
}
