//! Chunk loading: ticket levels, per-chunk generation state and the scheduler driving them.

pub mod chunk_generation_task;
pub mod chunk_generator;
pub mod chunk_holder;
pub mod chunk_level;
pub mod chunk_map;
pub mod chunk_pyramid;
pub mod chunk_result;
pub mod chunk_status;
pub mod chunk_task_priority_queue;
pub mod chunk_ticket_manager;
pub mod chunk_tracker;
pub mod dynamic_graph;
pub mod main_thread_executor;
pub mod section_tracker;
pub mod ticket;
