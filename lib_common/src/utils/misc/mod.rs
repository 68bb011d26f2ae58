/// Host platform and process helpers.
pub mod sys_info;
