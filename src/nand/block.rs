//! The block-level view of a [Controller], for consumers written against [Nand]

use crate::controller::{Controller, PageBuffer, PageData};
use crate::hw::NandHardware;
use crate::nand::{Nand, NandBlock, NandLayout};

/// A good block of a [Controller]
pub struct ControllerBlock<'a, H> {
    controller: &'a mut Controller<H>,
    index: u32,
}

impl<H: NandHardware> Nand for Controller<H> {
    type Block<'a> = ControllerBlock<'a, H> where Self: 'a;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        if self.is_bad(index)? {
            return Ok(None);
        }

        Ok(Some(ControllerBlock {
            controller: self,
            index,
        }))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout()
    }
}

impl<H> ControllerBlock<'_, H> {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl<H: NandHardware> ControllerBlock<'_, H> {
    fn page_index(&self, page: u32) -> anyhow::Result<u32> {
        anyhow::ensure!(page < self.page_count(), "page index out of bounds");
        Ok(self.index * self.page_count() + page)
    }
}

impl<H: NandHardware> NandBlock for ControllerBlock<'_, H> {
    fn page_count(&self) -> u32 {
        self.controller.layout().pages_per_block
    }

    fn page_size(&self) -> usize {
        self.controller.geometry().page_size
    }

    fn read(&mut self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let page_size = self.page_size();
        anyhow::ensure!(content.len() % page_size == 0, "content not page-sized");

        for (page, chunk) in (start_page..).zip(content.chunks_mut(page_size)) {
            let page = self.page_index(page)?;
            self.controller.read_page(
                page,
                PageBuffer {
                    data: chunk,
                    oob: &mut [],
                },
            )?;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let page_size = self.page_size();
        anyhow::ensure!(content.len() % page_size == 0, "content not page-sized");

        for (page, chunk) in (start_page..).zip(content.chunks(page_size)) {
            let page = self.page_index(page)?;
            self.controller.write_page(page, PageData::new(chunk))?;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        Ok(self.controller.erase_block(self.index)?)
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        Ok(self.controller.mark_bad(self.index)?)
    }
}
