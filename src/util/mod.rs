// SPDX-License-Identifier: Apache-2.0
pub mod disk_size;
pub mod fs;
