// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

pub mod amqp;
pub mod binding;
pub mod broker;
pub mod connection;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod node;
pub mod queue;
pub mod readiness;
pub mod topology;
